use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use snafu::{OptionExt, ResultExt, Snafu};
use tracing_subscriber::EnvFilter;
use zova_client::{Blob, HttpBackend, MemoryBlobStore, StaticToken};
use zova_sync::attachments;
use zova_sync::{
    ComposeOutcome, DeliveryMode, IngestOutcome, LiveTraceReconstructor, Message, MessageStatus,
    Role, SendCoordinator, SessionId, SettingsStore, SyncError, TraceUpdate,
};

const USAGE: &str = "usage: zova-sync --session ID [--config PATH] [--older N] [--batched] \
                     [--send TEXT]... [--attach PATH] [--flush] [--trace]";

#[derive(Debug, Default)]
struct CliArgs {
    session: Option<String>,
    config_path: Option<PathBuf>,
    older_pages: usize,
    batched: bool,
    sends: Vec<String>,
    /// Attached to the first `--send`.
    attachment: Option<PathBuf>,
    flush: bool,
    trace: bool,
}

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("missing required --session argument\n{USAGE}"))]
    MissingSession { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("invalid value '{raw}' for '{arg}'"))]
    InvalidArgumentValue {
        stage: &'static str,
        arg: &'static str,
        raw: String,
    },
    #[snafu(display("unknown argument '{raw}'\n{USAGE}"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("failed to read attachment {}: {source}", path.display()))]
    ReadAttachment {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to build backend: {source}"))]
    Backend {
        stage: &'static str,
        source: zova_client::BackendError,
    },
    #[snafu(display("{source}"))]
    Engine {
        stage: &'static str,
        source: SyncError,
    },
}

type CliResult<T> = Result<T, CliError>;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run().await {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> CliResult<()> {
    let args = parse_args(env::args().skip(1))?;
    let session_id = SessionId::new(args.session.clone().context(MissingSessionSnafu {
        stage: "parse-args-session",
    })?);

    let settings_store = match &args.config_path {
        Some(path) => SettingsStore::new(path.clone()),
        None => SettingsStore::load(),
    };
    let settings = settings_store.settings();
    tracing::info!(endpoint = %settings.endpoint, path = ?settings_store.path(), "settings loaded");

    let backend = HttpBackend::new(
        settings.backend_config(),
        Arc::new(StaticToken::new(settings.api_token.clone())),
    )
    .context(BackendSnafu {
        stage: "build-http-backend",
    })?;
    let blobs = Arc::new(MemoryBlobStore::new());
    let coordinator = SendCoordinator::new(
        Arc::new(backend.clone()),
        blobs.clone(),
        settings.clone(),
    )
    .context(EngineSnafu {
        stage: "build-coordinator",
    })?;
    let session = coordinator.open_session(session_id.clone());
    if args.batched {
        coordinator
            .set_mode(&session_id, DeliveryMode::Batched)
            .context(EngineSnafu {
                stage: "set-delivery-mode",
            })?;
    }

    let paginator = session.paginator();
    paginator.load_latest().await.context(EngineSnafu {
        stage: "load-latest-page",
    })?;
    for _ in 0..args.older_pages {
        let page = paginator.load_older().await.context(EngineSnafu {
            stage: "load-older-page",
        })?;
        if page.is_none() {
            break;
        }
    }
    for message in session.store().all() {
        print_message(&message);
    }

    let mut attachment = args.attachment.clone();
    for text in &args.sends {
        let content = match attachment.take() {
            Some(path) => {
                let bytes = std::fs::read(&path).context(ReadAttachmentSnafu {
                    stage: "read-attachment",
                    path: path.clone(),
                })?;
                let name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned());
                let blob = Blob::new(mime_type_for(&path), bytes);
                attachments::attach(blobs.as_ref(), text, blob, name)
                    .await
                    .context(EngineSnafu {
                        stage: "store-attachment",
                    })?
            }
            None => text.as_str().into(),
        };
        let outcome = coordinator
            .compose(&session_id, content)
            .await
            .context(EngineSnafu { stage: "compose" })?;
        match outcome {
            ComposeOutcome::Streamed {
                assistant_id,
                outcome,
                ..
            } => {
                if let Some(reply) = session.store().get(assistant_id) {
                    print_message(&reply);
                }
                if let IngestOutcome::Completed {
                    usage: Some(usage), ..
                } = outcome
                {
                    println!("usage\t{usage}");
                }
            }
            ComposeOutcome::Queued { user_id } => println!("queued\t{user_id}"),
            ComposeOutcome::Busy => println!("busy"),
        }
    }

    if args.flush {
        let flushed = coordinator
            .flush(&session_id)
            .await
            .context(EngineSnafu {
                stage: "flush-batch",
            })?;
        for id in flushed.inserted {
            if let Some(message) = session.store().get(id) {
                print_message(&message);
            }
        }
        if flushed.requeued > 0 {
            println!("requeued\t{}", flushed.requeued);
        }
    }

    if args.trace {
        tail_trace(&backend, &settings_store).await;
    }
    Ok(())
}

async fn tail_trace(backend: &HttpBackend, settings_store: &SettingsStore) {
    let handle = backend.open_trace_feed(settings_store.settings().trace_channel_config());
    tokio::spawn(handle.worker);

    let reconstructor = Arc::new(LiveTraceReconstructor::new());
    let mut updates = reconstructor.subscribe();
    let printer = tokio::spawn({
        let reconstructor = reconstructor.clone();
        async move {
            while let Ok(update) = updates.recv().await {
                match update {
                    TraceUpdate::BlockAppended {
                        request_id,
                        round_index,
                        ..
                    } => {
                        let blocks = reconstructor
                            .item(&request_id)
                            .map(|item| item.rounds.iter().map(|round| round.blocks.len()).sum::<usize>())
                            .unwrap_or_default();
                        println!("trace\t{request_id}\tround {round_index}\t{blocks} block(s)");
                    }
                    TraceUpdate::Finished { request_id, .. } => {
                        println!("trace\t{request_id}\tdone");
                    }
                    TraceUpdate::Status(status) => println!("channel\t{status:?}"),
                }
            }
        }
    });

    reconstructor.run(handle.feed).await;
    printer.abort();
}

fn mime_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("txt" | "md") => "text/plain",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn print_message(message: &Message) {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    let status = match &message.status {
        MessageStatus::Pending => "pending".to_string(),
        MessageStatus::Streaming => "streaming".to_string(),
        MessageStatus::Done => "done".to_string(),
        MessageStatus::Interrupted(reason) => format!("interrupted: {reason}"),
        MessageStatus::Cancelled => "cancelled".to_string(),
    };
    println!(
        "{}\t{role}\t{status}\t{}",
        message.id,
        message.content.text().replace('\n', " ")
    );
}

fn parse_args(args: impl IntoIterator<Item = String>) -> CliResult<CliArgs> {
    let mut parsed = CliArgs::default();
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--session" => {
                parsed.session = Some(pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-session-value",
                    arg: "--session",
                })?);
            }
            "--config" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-config-value",
                    arg: "--config",
                })?;
                parsed.config_path = Some(PathBuf::from(value));
            }
            "--older" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-older-value",
                    arg: "--older",
                })?;
                parsed.older_pages = value.parse().ok().context(InvalidArgumentValueSnafu {
                    stage: "parse-args-older",
                    arg: "--older",
                    raw: value.clone(),
                })?;
            }
            "--send" => {
                parsed.sends.push(pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-send-value",
                    arg: "--send",
                })?);
            }
            "--attach" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-attach-value",
                    arg: "--attach",
                })?;
                parsed.attachment = Some(PathBuf::from(value));
            }
            "--batched" => parsed.batched = true,
            "--flush" => parsed.flush = true,
            "--trace" => parsed.trace = true,
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(parsed)
}
