use std::env;
use std::sync::Arc;
use std::time::Duration;

use snafu::{OptionExt, ResultExt, Snafu};

use scenecast::history;
use scenecast::{Role, SettingsStore, Studio, StudioError, StudioSettings};
use scenecast_storage::{SessionId, SessionStore, SqliteStorage, Storage, StorageError};
use scenecast_stream::{GenerationRequest, ScriptedSource, SourceError, Style};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Replay {
        topic: String,
        frames_path: String,
        style: Option<Style>,
        theme: Option<String>,
        cancel_after: Option<usize>,
    },
    Show {
        session: String,
    },
    Sessions,
}

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("usage: scenecast <replay|show|sessions> [options]"))]
    MissingCommand { stage: &'static str },
    #[snafu(display("unknown command '{raw}'"))]
    UnknownCommand { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("missing required argument '{arg}'"))]
    MissingArgument {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("invalid value '{raw}' for argument '{arg}'"))]
    InvalidArgumentValue {
        stage: &'static str,
        arg: &'static str,
        raw: String,
    },
    #[snafu(display("failed to read frames file '{path}': {source}"))]
    ReadFrames {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to load frames: {source}"))]
    LoadFrames {
        stage: &'static str,
        source: SourceError,
    },
    #[snafu(display("storage failed: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("studio failed: {source}"))]
    Studio {
        stage: &'static str,
        source: StudioError,
    },
    #[snafu(display("session '{session}' was not found"))]
    SessionNotFound {
        stage: &'static str,
        session: String,
    },
}

type CliResult<T> = Result<T, CliError>;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(error) = run().await {
        eprintln!("scenecast_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> CliResult<()> {
    let command = parse_args(env::args().skip(1))?;
    let settings = SettingsStore::load().settings();
    let storage = SqliteStorage::open(&settings.database_path)
        .await
        .context(StorageSnafu {
            stage: "open-database",
        })?;

    match command {
        Command::Replay {
            topic,
            frames_path,
            style,
            theme,
            cancel_after,
        } => {
            let mut request = GenerationRequest::new(topic, style.unwrap_or(settings.default_style));
            if let Some(theme) = theme {
                request = request.with_theme(theme);
            }
            run_replay(settings, Arc::new(storage), request, &frames_path, cancel_after).await
        }
        Command::Show { session } => run_show(&storage, &session),
        Command::Sessions => run_sessions(&storage),
    }
}

async fn run_replay(
    settings: Arc<StudioSettings>,
    storage: Arc<dyn Storage>,
    request: GenerationRequest,
    frames_path: &str,
    cancel_after: Option<usize>,
) -> CliResult<()> {
    let text = std::fs::read_to_string(frames_path).context(ReadFramesSnafu {
        stage: "replay-read-frames",
        path: frames_path.to_string(),
    })?;
    let source = ScriptedSource::from_json_lines(&text)
        .context(LoadFramesSnafu {
            stage: "replay-parse-frames",
        })?
        .with_frame_delay(Duration::from_millis(settings.frame_delay_ms));
    println!("frame_count={}", source.frames().len());
    println!("style={} ({})", request.style, request.style.description());

    let mut studio = Studio::new(Arc::new(source), storage, settings);
    let handle = studio.submit_request(request).context(StudioSnafu {
        stage: "replay-submit",
    })?;

    if let Some(limit) = cancel_after {
        let mut applied = 0;
        while applied < limit && studio.pump_one().await.context(StudioSnafu {
            stage: "replay-pump",
        })? {
            applied += 1;
        }
        let cancelled = studio
            .cancel_active(handle.message_id())
            .context(StudioSnafu {
                stage: "replay-cancel",
            })?;
        println!("cancelled={cancelled}");
    }
    studio.run_until_idle().await.context(StudioSnafu {
        stage: "replay-drain",
    })?;

    if let Some(session_id) = studio.session_id() {
        println!("session_id={session_id}");
    }
    if let Some(task) = studio.task(handle.message_id()) {
        println!("phase={:?}", task.phase);
        println!("progress={:.2}", task.progress);
        println!("scene_count={}", task.scenes.len());
        println!("status={}", task.status_line());
    }
    Ok(())
}

fn run_show(storage: &SqliteStorage, session: &str) -> CliResult<()> {
    let session_id = SessionId::parse(session).context(StorageSnafu {
        stage: "show-parse-session-id",
    })?;
    let snapshot = storage
        .load_session(session_id)
        .context(StorageSnafu {
            stage: "show-load-session",
        })?
        .context(SessionNotFoundSnafu {
            stage: "show-load-session",
            session: session.to_string(),
        })?;

    println!("session={} title={}", snapshot.session.id, snapshot.session.title);
    for message in history::hydrate_snapshot(&snapshot) {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        match &message.task {
            Some(task) => println!("[{role}] {} ({})", message.content, task.status_line()),
            None => println!("[{role}] {}", message.content),
        }
    }
    Ok(())
}

fn run_sessions(storage: &SqliteStorage) -> CliResult<()> {
    let sessions = storage.list_sessions(false).context(StorageSnafu {
        stage: "list-sessions",
    })?;
    for session in sessions {
        println!("{} {}", session.id, session.title);
    }
    Ok(())
}

fn parse_args(args: impl IntoIterator<Item = String>) -> CliResult<Command> {
    let mut pending = args.into_iter();
    let command = pending.next().context(MissingCommandSnafu {
        stage: "parse-args-command",
    })?;

    let mut topic = None;
    let mut frames_path = None;
    let mut style = None;
    let mut theme = None;
    let mut cancel_after = None;
    let mut session = None;

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--topic" => topic = Some(next_value(&mut pending, "--topic")?),
            "--frames" => frames_path = Some(next_value(&mut pending, "--frames")?),
            "--session" => session = Some(next_value(&mut pending, "--session")?),
            "--theme" => theme = Some(next_value(&mut pending, "--theme")?),
            "--style" => {
                let value = next_value(&mut pending, "--style")?;
                let parsed = Style::parse(&value).context(InvalidArgumentValueSnafu {
                    stage: "parse-args-style",
                    arg: "--style",
                    raw: value.clone(),
                })?;
                style = Some(parsed);
            }
            "--cancel-after" => {
                let value = next_value(&mut pending, "--cancel-after")?;
                let parsed = value.parse::<usize>().ok().context(InvalidArgumentValueSnafu {
                    stage: "parse-args-cancel-after",
                    arg: "--cancel-after",
                    raw: value.clone(),
                })?;
                cancel_after = Some(parsed);
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    match command.as_str() {
        "replay" => Ok(Command::Replay {
            topic: topic.context(MissingArgumentSnafu {
                stage: "parse-args-replay",
                arg: "--topic",
            })?,
            frames_path: frames_path.context(MissingArgumentSnafu {
                stage: "parse-args-replay",
                arg: "--frames",
            })?,
            style,
            theme,
            cancel_after,
        }),
        "show" => Ok(Command::Show {
            session: session.context(MissingArgumentSnafu {
                stage: "parse-args-show",
                arg: "--session",
            })?,
        }),
        "sessions" => Ok(Command::Sessions),
        _ => UnknownCommandSnafu {
            stage: "parse-args-command",
            raw: command,
        }
        .fail(),
    }
}

fn next_value(
    pending: &mut impl Iterator<Item = String>,
    arg: &'static str,
) -> CliResult<String> {
    pending.next().context(MissingArgumentValueSnafu {
        stage: "parse-args-value",
        arg,
    })
}
