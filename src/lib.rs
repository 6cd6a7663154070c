//! Ariadne: Redmine wiki to MediaWiki XML migration pipeline
//!
//! The migration runs as a sequence of stages that hand their results to each
//! other through JSON buckets in a workspace directory:
//!
//! 1. **Analyze** -- Load pages and revisions from a source snapshot, build
//!    globally unique titles, synthesize redirect pages, and register
//!    attachments and diagrams as file pages
//! 2. **Convert** -- Run every revision body through the markup pipeline
//!    (HTML/Textile to wikitext via an external converter, macro expansion,
//!    link resolution against the frozen title space)
//! 3. **Extract** -- Copy attachment payloads and decode diagrams into the
//!    upload directory
//! 4. **Compose** -- Serialize pages and their ordered revisions as a
//!    MediaWiki XML import dump
//! 5. **Stats** -- Cross-check the buckets and report unresolved references
//!
//! # Architecture
//!
//! - **Frozen title space** -- Every title exists before the first link is
//!   resolved; conversion only reads it
//! - **Bounded concurrency** -- Pages convert in parallel on a tokio runtime,
//!   each page's revisions in version order
//! - **Placeholder side tables** -- Code regions leave the text before any
//!   rewrite stage and come back at the end
//! - **Resumable conversion** -- Checkpoints let an interrupted convert skip
//!   pages it already finished
//!
//! # Key Modules
//!
//! - [`source`] -- Source rows and the JSON snapshot reader
//! - [`loader`] -- Pages, revisions and revision chains
//! - [`title`] -- Hierarchical title building
//! - [`redirect`] -- Redirect page synthesis
//! - [`attachment`] -- Attachment and diagram file pages
//! - [`index`] -- The frozen title space
//! - [`links`] -- Link resolution and loose title equivalence
//! - [`content`] -- Text rewrite stages
//! - [`convert`] -- The conversion pipeline and its driver
//! - [`external`] -- The external markup converter
//! - [`compose`] -- XML dump composer
//! - [`stats`] -- Counters, diagnostics and the integrity report
//!
//! # Example Usage
//!
//! ```bash
//! ariadne analyze -s redmine.json.bz2 -w work/ -c customizations.json
//! ariadne convert -w work/ --max-parallel 8
//! ariadne extract -w work/ --files-dir /var/lib/redmine/files
//! ariadne compose -w work/ -o dump.xml
//! ariadne stats -w work/
//! ```

pub mod analyze;
pub mod attachment;
pub mod buckets;
pub mod checkpoint;
pub mod compose;
pub mod config;
pub mod content;
pub mod convert;
pub mod customize;
pub mod error;
pub mod external;
pub mod extract;
pub mod ids;
pub mod index;
pub mod lexers;
pub mod links;
pub mod loader;
pub mod models;
pub mod placeholder;
pub mod redirect;
pub mod source;
pub mod stats;
pub mod title;
