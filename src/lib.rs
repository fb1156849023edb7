//! # Metadata Harvester
//!
//! A connector-driven framework for harvesting geospatial catalog metadata
//! from heterogeneous sources and publishing it to catalogs and folders.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────────┐   ┌──────────────┐
//! │ Input       │──▶│   Process    │──▶│ Links            │──▶│ Output       │
//! │ UNC / WAF   │   │ pull-iterate │   │ filter/transform │   │ FOLDER / GPT │
//! └─────────────┘   └──────┬───────┘   └──────────────────┘   │ CONSOLE      │
//!                          │                                  └──────────────┘
//!               ┌──────────┴──────────┐
//!               ▼                     ▼
//!        ┌────────────┐        ┌────────────┐
//!        │  History   │        │  Triggers  │
//!        │ mem/SQLite │        │ NOW/AT/... │
//!        └────────────┘        └────────────┘
//! ```
//!
//! A [`models::TaskDefinition`] names one input broker and a tree of
//! destinations. The [`engine::Engine`] resolves every definition through
//! its registries, builds a [`process::Process`] and runs it, recording
//! per-run counters in the [`history`] when the task is stored.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Definitions and harvested records |
//! | [`traits`] | Connector, broker, filter, transformer and trigger traits |
//! | [`engine`] | Registries and services |
//! | [`process`] | Harvest runs and their listeners |
//! | [`link`] | Destination trees |
//! | [`collector`] | Single source to many destinations loop |
//! | [`history`] | Per-run reports (memory or SQLite) |
//! | [`connector_unc`] | Local or shared folder input |
//! | [`connector_waf`] | Web accessible folder input |
//! | [`connector_folder`] | Folder output |
//! | [`connector_gpt`] | Geoportal Server output |
//! | [`connector_console`] | Console output |
//! | [`filter_regex`] | Source URI filter |
//! | [`transformer_dc`] | Dublin Core transformer |
//! | [`triggers`] | NOW, AT and PERIOD triggers |

pub mod collector;
pub mod config;
pub mod connector_console;
pub mod connector_folder;
pub mod connector_gpt;
pub mod connector_unc;
pub mod connector_waf;
pub mod crud;
pub mod db;
pub mod definition;
pub mod engine;
pub mod error;
pub mod filter_regex;
pub mod history;
pub mod http;
pub mod link;
pub mod meta;
pub mod migrate;
pub mod mime;
pub mod models;
pub mod process;
pub mod report;
pub mod robots;
pub mod scrambler;
pub mod template;
pub mod traits;
pub mod transformer_dc;
pub mod triggers;
