//! CLI: stdin/stdout REPL for local use of the task service.

use std::str::FromStr;

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::service::{Request, SubmitRequest, TaskService};
use crate::store::TaskFilter;
use crate::task::{TaskId, TaskStatus};

pub const HELP: &str = "\
Commands:
  submit <type> [json-payload]     submit a task, e.g. submit batch {\"items\": 5, \"delay_ms\": 200}
  status <id>                      show status and progress
  result <id>                      show the result of a completed task
  cancel <id>                      cancel a pending or running task
  list [status] [type=<t>] [limit=<n>]
  summary                          count tasks per status
  types                            list registered task types
  {\"op\": ...}                      send a raw JSON request
  help | quit";

/// A parsed REPL line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Request(Request),
    Types,
    Help,
    Quit,
}

/// Parse one input line.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    if line.starts_with('{') {
        return serde_json::from_str(line)
            .map(Command::Request)
            .map_err(|e| format!("invalid JSON request: {e}"));
    }

    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let request = match word.to_lowercase().as_str() {
        "help" | "?" => return Ok(Command::Help),
        "quit" | "exit" => return Ok(Command::Quit),
        "types" => return Ok(Command::Types),
        "summary" => Request::Summary,
        "submit" => {
            let (task_type, payload) = match rest.split_once(char::is_whitespace) {
                Some((task_type, payload)) => (task_type, payload.trim()),
                None => (rest, ""),
            };
            if task_type.is_empty() {
                return Err("usage: submit <type> [json-payload]".to_string());
            }
            let payload = if payload.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_str(payload).map_err(|e| format!("invalid payload: {e}"))?
            };
            Request::Submit(SubmitRequest {
                task_type: task_type.into(),
                payload,
                timeout_secs: None,
            })
        }
        "status" => Request::Status {
            task_id: parse_id(rest)?,
        },
        "result" => Request::Result {
            task_id: parse_id(rest)?,
        },
        "cancel" => Request::Cancel {
            task_id: parse_id(rest)?,
        },
        "list" => Request::List(parse_filter(rest)?),
        other => return Err(format!("unknown command '{other}', try 'help'")),
    };
    Ok(Command::Request(request))
}

fn parse_id(arg: &str) -> Result<TaskId, String> {
    if arg.is_empty() {
        return Err("missing task id".to_string());
    }
    TaskId::from_str(arg).map_err(|e| format!("invalid task id '{arg}': {e}"))
}

fn parse_filter(args: &str) -> Result<TaskFilter, String> {
    let mut filter = TaskFilter::new();
    for arg in args.split_whitespace() {
        if let Some(task_type) = arg.strip_prefix("type=") {
            filter = filter.with_type(task_type);
        } else if let Some(limit) = arg.strip_prefix("limit=") {
            let limit = limit
                .parse::<usize>()
                .map_err(|e| format!("invalid limit '{limit}': {e}"))?;
            filter = filter.with_limit(limit);
        } else {
            filter = filter.with_status(TaskStatus::from_str(arg)?);
        }
    }
    Ok(filter)
}

/// Read commands from stdin until EOF or `quit`, printing JSON responses.
pub async fn run_repl(service: TaskService) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    eprintln!("{HELP}");
    eprint!("> ");

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break, // EOF
            Err(e) => {
                tracing::error!("Error reading stdin: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            eprint!("> ");
            continue;
        }

        match parse_command(&line) {
            Ok(Command::Quit) => break,
            Ok(Command::Help) => eprintln!("{HELP}"),
            Ok(Command::Types) => {
                let types: Vec<String> = service
                    .manager()
                    .task_types()
                    .iter()
                    .map(|t| t.to_string())
                    .collect();
                println!("{}", types.join(", "));
            }
            Ok(Command::Request(request)) => match service.dispatch(request).await {
                Ok(response) => println!("{}", serde_json::to_string_pretty(&response)?),
                Err(e) => eprintln!("error: {e}"),
            },
            Err(message) => eprintln!("{message}"),
        }
        eprint!("> ");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_submit_with_payload() {
        let cmd = parse_command(r#"submit batch {"items": 3}"#).unwrap();
        assert_eq!(
            cmd,
            Command::Request(Request::Submit(SubmitRequest {
                task_type: "batch".into(),
                payload: json!({"items": 3}),
                timeout_secs: None,
            }))
        );
    }

    #[test]
    fn submit_without_payload_sends_null() {
        let Command::Request(Request::Submit(req)) = parse_command("submit echo").unwrap() else {
            panic!("expected submit");
        };
        assert_eq!(req.payload, serde_json::Value::Null);
    }

    #[test]
    fn parses_id_commands() {
        let id = TaskId::new();
        assert_eq!(
            parse_command(&format!("cancel {id}")).unwrap(),
            Command::Request(Request::Cancel { task_id: id })
        );
        assert!(parse_command("status not-an-id").is_err());
        assert!(parse_command("result").is_err());
    }

    #[test]
    fn parses_list_filters() {
        let cmd = parse_command("list completed type=batch limit=5").unwrap();
        assert_eq!(
            cmd,
            Command::Request(Request::List(
                TaskFilter::new()
                    .with_status(TaskStatus::Completed)
                    .with_type("batch")
                    .with_limit(5)
            ))
        );
        assert!(parse_command("list finished").is_err());
    }

    #[test]
    fn parses_raw_json_request() {
        assert_eq!(
            parse_command(r#"{"op": "summary"}"#).unwrap(),
            Command::Request(Request::Summary)
        );
    }

    #[test]
    fn control_words() {
        assert_eq!(parse_command("QUIT").unwrap(), Command::Quit);
        assert_eq!(parse_command("help").unwrap(), Command::Help);
        assert!(parse_command("frobnicate").is_err());
    }
}
