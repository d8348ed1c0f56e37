//! relayd - smart-city video relay daemon
//!
//! Starts the supervised analytics graph and the HTTP stream server in one
//! process. Exits non-zero if the pipeline hits a fatal error.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use smartcity_relay::annotate::{AnnotatorContext, Overlay};
use smartcity_relay::fps::FpsMeter;
use smartcity_relay::metrics::{InfluxSink, MetricsSink, NullSink};
use smartcity_relay::pipeline::{self, GraphFactory, Supervisor, SupervisorState, SyntheticFactory};
use smartcity_relay::server::{RelayServer, ServerConfig};
use smartcity_relay::{ChannelRegistry, RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay analytics-annotated camera streams over HTTP")]
struct Args {
    /// Camera config file (JSON or TOML).
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: PathBuf,

    /// Detection model path, or `stub` for the built-in detector.
    #[arg(long)]
    model: Option<String>,

    /// Disable object tracking. Collision checks keep it on unless also disabled.
    #[arg(long)]
    no_tracking: bool,

    /// Disable collision detection.
    #[arg(long)]
    no_collision: bool,

    /// HTTP listen address.
    #[arg(long)]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = RelayConfig::load(Some(&args.config))?;
    if let Some(model) = args.model {
        cfg.model = model;
    }
    if let Some(addr) = args.addr {
        cfg.addr = addr;
    }
    if args.no_tracking {
        cfg.tracking = false;
    }
    if args.no_collision {
        cfg.collision = false;
    }
    cfg.validate()?;
    log::info!(
        "relayd {} starting with {} camera(s), model={}",
        env!("CARGO_PKG_VERSION"),
        cfg.cameras.len(),
        cfg.model
    );

    let metrics: Arc<dyn MetricsSink> = match &cfg.influx {
        Some(influx) => Arc::new(InfluxSink::connect(influx.clone())?),
        None => {
            log::info!("metrics persistence disabled");
            Arc::new(NullSink)
        }
    };

    let overlay = match &cfg.font_path {
        Some(path) => Overlay::with_font_file(path)?,
        None => Overlay::bundled()?,
    };
    let registry = Arc::new(ChannelRegistry::new(cfg.cameras.len()));
    let ctx = AnnotatorContext {
        registry: registry.clone(),
        fps: Arc::new(FpsMeter::new(cfg.cameras.len())),
        overlay: Arc::new(overlay),
        metrics,
        settings: cfg.annotator_settings(),
    };
    let handlers = pipeline::build_branches(&cfg.cameras, &cfg.model, &ctx)?;
    let factory = graph_factory(&cfg)?;
    let supervisor = Supervisor::new(factory, cfg.cameras.clone(), handlers, cfg.restart.clone());
    let supervisor = supervisor.spawn()?;
    while !supervisor.is_finished() && supervisor.state()? != SupervisorState::Running {
        std::thread::sleep(Duration::from_millis(20));
    }
    if supervisor.is_finished() {
        // First build failed; nothing is live yet.
        return supervisor.join();
    }

    let server = RelayServer::new(
        ServerConfig {
            addr: cfg.addr.clone(),
            stream: cfg.stream.clone(),
            dashboard: cfg.dashboard_json(),
        },
        registry,
    )
    .spawn()?;
    log::info!("streams available at http://{}/camera/<id>", server.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("relayd running (Ctrl-C to stop)");
    loop {
        if rx.recv_timeout(Duration::from_millis(200)).is_ok() {
            log::info!("shutdown signal received");
            break;
        }
        if supervisor.is_finished() {
            break;
        }
    }

    server.stop()?;
    match supervisor.stop() {
        Ok(()) => {
            log::info!("relayd stopped");
            Ok(())
        }
        Err(err) => {
            log::error!("pipeline failed: {:#}", err);
            std::process::exit(1);
        }
    }
}

fn graph_factory(cfg: &RelayConfig) -> Result<Arc<dyn GraphFactory>> {
    if cfg.all_synthetic() {
        log::info!("all cameras are stub:// sources, using the synthetic graph");
        return Ok(Arc::new(SyntheticFactory::default()));
    }
    #[cfg(feature = "pipeline-gstreamer")]
    {
        Ok(Arc::new(pipeline::GstreamerFactory))
    }
    #[cfg(not(feature = "pipeline-gstreamer"))]
    {
        anyhow::bail!(
            "camera sources need the pipeline-gstreamer feature (only stub:// sources are built in)"
        )
    }
}
