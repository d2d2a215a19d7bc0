//! # Channel Harvest
//!
//! A rate-aware ingestion pipeline for public messaging channels.
//!
//! Channel Harvest pulls messages and photos from a set of channels,
//! persists every batch as a date-partitioned raw snapshot, loads snapshots
//! idempotently into a canonical SQLite store, and runs object detection
//! over the harvested images to derive a category per image.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌──────────┐   ┌────────────┐
//! │  Harvester   │──▶│  RawStore   │──▶│  Loader  │──▶│  messages  │
//! │ (governed)   │   │ day/chan.json│  └──────────┘   └────────────┘
//! └──────┬───────┘   └──────┬──────┘
//!        │ photos           │ image paths
//!        ▼                  ▼
//!   image_path/      ┌────────────┐   ┌──────────────────┐
//!   <chan>/<id>.jpg ─▶│ Classifier │──▶│ image_detections │
//!                    └────────────┘   └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! harvest init                      # create database
//! harvest harvest                   # harvest channels, write today's partitions
//! harvest load                      # load today's partitions
//! harvest classify                  # classify today's images
//! harvest run                       # all of the above, then transform
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`preflight`] | Startup checks and credentials |
//! | [`error`] | Error kinds and seam errors |
//! | [`models`] | Core data types and category rules |
//! | [`source`] | Upstream message source |
//! | [`governor`] | Account-wide throttle backoff |
//! | [`harvest`] | Channel cursors and media download |
//! | [`raw_store`] | Date-partitioned snapshot files |
//! | [`store`] | Canonical record store |
//! | [`loader`] | Snapshot → canonical store loading |
//! | [`detect`] | Object detection backends |
//! | [`classify`] | Image classification |
//! | [`pipeline`] | Stage sequencing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod channels;
pub mod classify;
pub mod config;
pub mod db;
pub mod detect;
pub mod error;
pub mod export;
pub mod governor;
pub mod harvest;
pub mod loader;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod preflight;
pub mod raw_store;
pub mod source;
pub mod stats;
pub mod store;
