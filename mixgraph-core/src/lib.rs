//! # mixgraph-core
//!
//! Local model of a mixing session: contexts holding tracks, sub-tracks,
//! racks with parallel chains, devices, parameters and the sends and
//! receives between them. Every edit validates first, updates the tree, and
//! reconciles the remote server graph inside one transaction scope so the
//! server sees a single bundle per edit.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mixgraph_core::{Application, Config};
//! use mixgraph_audio::NullTransport;
//!
//! let config = Config::load();
//! let mut app = Application::new(config.channel_count());
//! let context = app.add_context(Some("main")).await?;
//! let track = app.add_track(context, Some("drums")).await?;
//! app.boot(Arc::new(NullTransport), config.server_options()).await?;
//! app.mute(track).await?;
//! ```
//!
//! ## Module Overview
//!
//! - [`application`]: the root aggregate, boot/quit and the transaction scope
//! - [`reconcile`]: tree splicing and remote allocation
//! - [`mixer`]: mute, solo and cue
//! - [`patch`]: send/receive resolution and patch synths
//! - [`perform`]: note flow through tracks, racks and devices
//! - [`persistence`]: flat JSON records and rebuild

pub mod application;
pub mod config;
pub mod context;
pub mod devices;
pub mod error;
pub mod mixer;
pub mod node;
pub mod parameters;
pub mod patch;
pub mod perform;
pub mod persistence;
pub mod racks;
pub mod reconcile;
pub mod tracks;
pub mod tree;

pub use application::{Application, Moment, Status};
pub use config::Config;
pub use error::{MixError, MixResult};
pub use node::{
    CaptureEntry, CaptureLabel, DeviceKind, Endpoint, NodeKind, PatchKind, SendPosition, TrackLevels, TrackRole,
    Transfer,
};
pub use parameters::{ParameterAction, ParameterKind, ParameterSpec};
pub use perform::Capture;
pub use persistence::{Document, Entity};
