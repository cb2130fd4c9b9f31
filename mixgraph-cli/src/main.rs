//! Command-line driver: builds a session, optionally against a live server,
//! prints the tree and writes the session out as JSON.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_std::task::block_on;
use mixgraph_audio::osc_transport::OscTransport;
use mixgraph_audio::{NullTransport, Transport};
use mixgraph_core::{Application, Config, DeviceKind, Document, MixResult};
use mixgraph_types::MidiMessage;

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

fn init_logging(verbose: bool) {
    use simplelog::*;

    let log_level = if verbose { LevelFilter::Debug } else { LevelFilter::Warn };

    let log_path = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mixgraph")
        .join("mixgraph.log");

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let log_file = match File::create(&log_path).or_else(|_| File::create(std::env::temp_dir().join("mixgraph.log"))) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("logging disabled: {}", e);
            return;
        }
    };

    if let Err(e) = WriteLogger::init(log_level, Config::default(), log_file) {
        eprintln!("logging disabled: {}", e);
        return;
    }

    log::info!("mixgraph starting (log level: {:?})", log_level);
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag).and_then(|i| args.get(i + 1).cloned())
}

async fn transport(config: &Config, connect: bool) -> Arc<dyn Transport> {
    if !connect {
        return Arc::new(NullTransport);
    }
    let address = config.server_address();
    match OscTransport::connect(&address, REPLY_TIMEOUT).await {
        Ok(transport) => {
            log::info!("connected to {}", address);
            Arc::new(transport)
        }
        Err(e) => {
            log::warn!("cannot reach {} ({}), running without a server", address, e);
            eprintln!("cannot reach {}: {}", address, e);
            Arc::new(NullTransport)
        }
    }
}

/// One context with the configured number of tracks, a rack on the first
/// track and an instrument on every chain.
async fn build_session(app: &mut Application, track_count: usize) -> MixResult {
    let context = app.add_context(Some("main")).await?;
    let mut tracks = Vec::with_capacity(track_count);
    for i in 0..track_count {
        tracks.push(app.add_track(context, Some(&format!("track {}", i + 1))).await?);
    }
    let Some(&first) = tracks.first() else {
        return Ok(());
    };
    let rack = app.add_rack(first, Some("layers")).await?;
    for name in ["low", "high"] {
        let chain = app.add_chain(rack, Some(name)).await?;
        let synth = DeviceKind::Instrument { synthdef: "default".to_string() };
        app.add_device(chain, synth, None).await?;
    }
    Ok(())
}

async fn run(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load();
    let mut app = match flag_value(args, "--load") {
        Some(path) => Application::deserialize(&Document::load(&PathBuf::from(path))?)?,
        None => {
            let mut app = Application::new(config.channel_count());
            build_session(&mut app, config.track_count()).await?;
            app
        }
    };

    let connect = args.iter().any(|a| a == "--connect");
    app.boot(transport(&config, connect).await, config.server_options()).await?;

    if let Some(track) = app.contexts().first().and_then(|c| app.tracks(*c).first().copied()) {
        let at = Some(config.latency());
        app.perform(track, &[MidiMessage::note_on(60, 100)], at).await?;
        app.perform(track, &[MidiMessage::note_off(60)], at).await?;
    }

    println!("{}", app);
    if connect {
        match app.query(app.root()).await {
            Ok(tree) => println!("{:#?}", tree),
            Err(e) => log::warn!("query failed: {}", e),
        }
    }

    if let Some(path) = flag_value(args, "--save") {
        app.serialize().save(&PathBuf::from(&path))?;
        println!("saved {}", path);
    }
    app.quit().await?;
    Ok(())
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let verbose = args.iter().any(|a| a == "--verbose" || a == "-v");
    init_logging(verbose);

    if let Err(e) = block_on(run(&args)) {
        log::error!("{}", e);
        eprintln!("mixgraph: {}", e);
        std::process::exit(1);
    }
}
