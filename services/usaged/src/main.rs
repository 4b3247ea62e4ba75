mod db_url;

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use admin_ipc::{run_server, AdminRequest, AdminResponse, AdminStatus, DEFAULT_SOCKET_PATH};
use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use clock::SystemClock;
use db_url::{ensure_parent_dir, validate_database_url};
use generator::ProfileTable;
use metrics::MetricsHandle;
use pipeline::{PipelineContext, PipelineHandle, PipelineSettings, DEFAULT_FAULT_BACKOFF};
use prober::{LivenessProber, ProbeConfig};
use state::StatusHandle;
use storage::{init_sqlite, SampleStore};
use tokio::{signal, task};
use tracing::{info, warn, Level};
use uuid::Uuid;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[arg(long, env = "PORT", default_value_t = 10000)]
    port: u16,

    #[arg(long, env = "SELF_PING_URL")]
    self_ping_url: Option<String>,

    #[arg(long, env = "ADMIN_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    admin_socket: String,

    /// JSON map of series name to profile; the built-in table when unset.
    #[arg(long, env = "PROFILES_PATH")]
    profiles: Option<PathBuf>,

    #[arg(long, env = "BACKFILL_ORIGIN", default_value = "2025-04-10T00:00:00Z")]
    origin: DateTime<Utc>,

    #[arg(long, env = "PROBE_INTERVAL_SECS", default_value_t = 300)]
    probe_interval_secs: u64,

    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 5)]
    poll_interval_secs: u64,
}

impl Args {
    fn http_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }
}

fn log_startup(args: &Args, profiles: &ProfileTable, run_id: &str) {
    info!(url = %args.database_url, "database configured");
    info!(addr = %args.http_addr(), "health server bind planned");
    info!(socket = %args.admin_socket, "admin socket bind planned");
    match &args.self_ping_url {
        Some(url) => info!(%url, interval_secs = args.probe_interval_secs, "self ping enabled"),
        None => warn!("SELF_PING_URL not set; self ping disabled"),
    }
    info!(series = profiles.len(), origin = %args.origin, "profiles loaded");
    info!(%run_id, "run initialized");
}

fn load_profiles(path: Option<&PathBuf>) -> anyhow::Result<ProfileTable> {
    match path {
        Some(path) => ProfileTable::from_path(path)
            .with_context(|| format!("loading profiles from {}", path.display())),
        None => Ok(ProfileTable::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    validate_database_url(&args.database_url)?;
    ensure_parent_dir(&args.database_url)?;
    let profiles = Arc::new(load_profiles(args.profiles.as_ref())?);
    info!(database = %args.database_url, "booting usaged");

    let run_id = Uuid::new_v4().to_string();
    let store = Arc::new(init_sqlite(&args.database_url).await?);
    store.insert_run(&run_id, None).await?;
    log_startup(&args, &profiles, &run_id);

    let metrics = MetricsHandle::new()?;
    let status = StatusHandle::new();
    let sample_store: Arc<dyn SampleStore> = store.clone();

    let health = metrics.clone();
    let health_store = sample_store.clone();
    let health_status = status.clone();
    let http_addr = args.http_addr();
    task::spawn(async move {
        if let Err(err) = health.serve(http_addr, health_store, health_status).await {
            tracing::error!(error = ?err, "health server error");
        }
    });

    let admin_status = status.clone();
    let admin_run_id = run_id.clone();
    let socket_path = args.admin_socket.clone();
    task::spawn(async move {
        let handler = move |req: AdminRequest| -> anyhow::Result<AdminResponse> {
            match req {
                AdminRequest::Status => Ok(AdminResponse::Status(AdminStatus {
                    run_id: admin_run_id.clone(),
                    pipeline: admin_status.snapshot(),
                })),
                AdminRequest::Stop => {
                    info!("stop requested over admin socket");
                    admin_status.request_stop();
                    Ok(AdminResponse::Ack)
                }
            }
        };
        if let Err(err) = run_server(&socket_path, handler).await {
            tracing::error!(error = ?err, "admin ipc server failed");
        }
    });

    let probe_config = ProbeConfig {
        interval: Duration::from_secs(args.probe_interval_secs.max(1)),
        ..ProbeConfig::new(args.self_ping_url.clone())
    };
    LivenessProber::new(probe_config, metrics.clone())?.spawn();

    let ctx = PipelineContext {
        store: sample_store,
        clock: Arc::new(SystemClock),
        profiles,
        metrics,
        status: status.clone(),
        settings: PipelineSettings {
            origin: args.origin,
            poll_interval: Duration::from_secs(args.poll_interval_secs.max(1)),
            fault_backoff: DEFAULT_FAULT_BACKOFF,
            seed: None,
        },
    };
    let pipeline = PipelineHandle::spawn(ctx);

    let stopper = status.clone();
    task::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                stopper.request_stop();
            }
            Err(err) => warn!(error = ?err, "failed to listen for shutdown signal"),
        }
    });

    info!(run_id = %run_id, addr = %http_addr, "ready");
    if let Err(err) = store
        .log_incident(&run_id, "info", "ready", "usaged booted and ready")
        .await
    {
        warn!(error = ?err, "failed to record ready incident");
    }

    pipeline.join().await?;
    info!(run_id = %run_id, "pipeline stopped; exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct VecWriter(Arc<Mutex<Vec<u8>>>);

    impl Write for VecWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut guard = self.0.lock().unwrap();
            guard.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for VecWriter {
        type Writer = VecWriter;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["usaged", "--database-url", "sqlite:///tmp/usage-test.db"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn startup_logs_include_configuration() {
        let args = parse(&[
            "--port",
            "9000",
            "--self-ping-url",
            "http://127.0.0.1:9000/helpline",
            "--admin-socket",
            "/tmp/usaged-test.sock",
        ]);
        let run_id = Uuid::nil().to_string();
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let writer = VecWriter(buffer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .with_writer(writer)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            log_startup(&args, &ProfileTable::default(), &run_id);
        });

        let output =
            String::from_utf8(buffer.lock().unwrap().clone()).expect("log output should be utf8");
        assert!(output.contains("database configured"));
        assert!(output.contains("health server bind planned"));
        assert!(output.contains("self ping enabled"));
        assert!(output.contains("profiles loaded"));
        assert!(output.contains("run initialized"));
        assert!(output.contains(&args.database_url));
        assert!(output.contains("0.0.0.0:9000"));
        assert!(output.contains("/tmp/usaged-test.sock"));
        assert!(output.contains(&run_id));
    }

    #[test]
    fn defaults_match_hosted_deployment() {
        let args = parse(&[]);
        if std::env::var_os("PORT").is_none() {
            assert_eq!(args.port, 10000);
        }
        if std::env::var_os("BACKFILL_ORIGIN").is_none() {
            assert_eq!(args.origin, pipeline::default_origin());
        }
        if std::env::var_os("PROBE_INTERVAL_SECS").is_none() {
            assert_eq!(args.probe_interval_secs, 300);
        }
    }

    #[test]
    fn database_url_is_required() {
        if std::env::var_os("DATABASE_URL").is_some() {
            return;
        }
        let err = Args::try_parse_from(["usaged"]).expect_err("missing url should fail");
        assert!(err.to_string().contains("--database-url"));
    }

    #[test]
    fn bad_profile_file_is_fatal() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "{{\"/x\": {{\"base\": -1}}}}").expect("write profile");
        let err = load_profiles(Some(&file.path().to_path_buf()))
            .expect_err("malformed profile should fail");
        assert!(err.to_string().contains("loading profiles from"));

        assert_eq!(load_profiles(None).expect("defaults").len(), 4);
    }
}
