//! `exam-session` binary: runs one timed assessment session driven by line commands on stdin.

use std::{env, sync::Arc, time::Duration};

use anyhow::{Context, bail};
use exam_session_engine::{
    EngineConfig, NetworkSignal, SessionError, SessionHandle,
    dao::{
        api::AssessmentApi,
        memory::{AssessmentFixture, InMemoryAssessmentApi},
    },
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    time::sleep,
};
use tokio_stream::{StreamExt, wrappers::WatchStream};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEMO_ASSESSMENT: &str = "demo";
/// Time given to the unload flush before the process exits.
const UNLOAD_GRACE: Duration = Duration::from_millis(500);

const HELP: &str = "commands: select <choice>..., next, prev, jump <index>, submit, \
                    offline, online, hide, show, quit";

/// Assessment server the session talks to.
struct Backend {
    api: Arc<dyn AssessmentApi>,
    /// Present in demo mode so connectivity commands also cut the simulated server off.
    simulated: Option<InMemoryAssessmentApi>,
}

enum Flow {
    Continue,
    Quit,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = EngineConfig::load();
    let demo = env::var("EXAM_DEMO").is_ok_and(|value| value == "1");
    let assessment_id = match env::var("EXAM_ASSESSMENT_ID") {
        Ok(id) => id,
        Err(_) if demo => DEMO_ASSESSMENT.to_string(),
        Err(_) => bail!("EXAM_ASSESSMENT_ID must be set (or run with EXAM_DEMO=1)"),
    };
    let backend = build_backend(demo, &assessment_id)?;

    let session = SessionHandle::spawn(backend.api.clone(), config);
    let started = session
        .start(assessment_id.as_str())
        .await
        .with_context(|| format!("starting attempt for assessment `{assessment_id}`"))?;
    info!(
        attempt_id = started.attempt_id.as_deref().unwrap_or_default(),
        remaining_seconds = started.remaining_seconds,
        questions = started.question_count,
        "session ready; {HELP}"
    );

    let mut printer = tokio::spawn(print_snapshots(session.clone()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested; flushing current answer");
                session.signal(NetworkSignal::Unloading)?;
                sleep(UNLOAD_GRACE).await;
                break;
            }
            _ = &mut printer => break,
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                match run_command(&session, &backend, line.trim()).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Quit) => break,
                    Err(err) => match err.downcast_ref::<SessionError>() {
                        Some(session_err) => {
                            warn!(kind = ?session_err.kind(), error = %session_err, "command refused")
                        }
                        None => warn!(error = %err, "command failed"),
                    },
                }
            }
        }
    }

    session.shutdown();
    Ok(())
}

fn build_backend(demo: bool, assessment_id: &str) -> anyhow::Result<Backend> {
    if demo {
        info!(assessment_id, "using the simulated assessment server");
        let server = InMemoryAssessmentApi::new().with_assessment(
            assessment_id,
            AssessmentFixture::sample(5, Duration::from_secs(300)),
        );
        return Ok(Backend {
            api: Arc::new(server.clone()),
            simulated: Some(server),
        });
    }

    http_backend()
}

#[cfg(feature = "http-api")]
fn http_backend() -> anyhow::Result<Backend> {
    use exam_session_engine::dao::http::{ApiConfig, HttpAssessmentApi};

    let config = ApiConfig::from_env().context("reading assessment API configuration")?;
    info!(base_url = %config.base_url, "using the HTTP assessment server");
    let api = HttpAssessmentApi::connect(config).context("building HTTP client")?;
    Ok(Backend {
        api: Arc::new(api),
        simulated: None,
    })
}

#[cfg(not(feature = "http-api"))]
fn http_backend() -> anyhow::Result<Backend> {
    bail!("built without the `http-api` feature; set EXAM_DEMO=1 to use the simulated server")
}

async fn run_command(
    session: &SessionHandle,
    backend: &Backend,
    line: &str,
) -> anyhow::Result<Flow> {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        return Ok(Flow::Continue);
    };

    match verb {
        "select" => {
            let choices = parts
                .map(str::parse::<usize>)
                .collect::<Result<Vec<_>, _>>()
                .context("choices must be numbers")?;
            let question = session.snapshot().current_question_index;
            let selection = session.select(question, choices).await?;
            info!(question, ?selection, "selection updated");
        }
        "next" => {
            session.next().await?;
        }
        "prev" | "previous" => {
            session.previous().await?;
        }
        "jump" => {
            let index = parts
                .next()
                .context("usage: jump <index>")?
                .parse::<usize>()
                .context("index must be a number")?;
            session.jump(index).await?;
        }
        "submit" => session.submit().await?,
        "offline" => {
            if let Some(server) = &backend.simulated {
                server.set_offline(true);
            }
            session.signal(NetworkSignal::ConnectivityLost)?;
        }
        "online" => {
            if let Some(server) = &backend.simulated {
                server.set_offline(false);
            }
            session.signal(NetworkSignal::ConnectivityRestored)?;
        }
        "hide" => session.signal(NetworkSignal::Hidden)?,
        "show" => session.signal(NetworkSignal::Visible)?,
        "help" => info!("{HELP}"),
        "quit" | "exit" => return Ok(Flow::Quit),
        other => bail!("unknown command `{other}`; {HELP}"),
    }
    Ok(Flow::Continue)
}

/// Print every published snapshot as one JSON line until the attempt is closed.
async fn print_snapshots(session: SessionHandle) {
    let mut updates = WatchStream::new(session.subscribe());
    let mut support_reported = false;

    while let Some(snapshot) = updates.next().await {
        match serde_json::to_string(&snapshot) {
            Ok(line) => println!("{line}"),
            Err(err) => warn!(error = %err, "failed to encode snapshot"),
        }
        if snapshot.support_required && !support_reported {
            support_reported = true;
            error!("submission could not be confirmed yet; contact support if this persists");
        }
        if snapshot.is_final() {
            info!(status = ?snapshot.status, "attempt closed");
            break;
        }
    }
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler; waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
