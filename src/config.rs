/// Namespace id of regular content pages
pub const NS_MAIN: i32 = 0;

/// Namespace id of file description pages
pub const NS_FILE: i32 = 6;

pub const FILE_NAMESPACE: &str = "File";
pub const CATEGORY_NAMESPACE: &str = "Category";
pub const USER_NAMESPACE: &str = "User";

/// Namespace prefix under which knowledge-base story links are written
pub const STORY_NAMESPACE: &str = "EKBStory";

/// Native page and revision ids must stay below this value.
pub const ATTACHMENT_ID_OFFSET: u32 = 1_000_000_000;

/// Synthetic diagram ids start here (diagram id + offset).
pub const DIAGRAM_ID_OFFSET: u32 = 1_500_000_000;

/// Attachment and diagram ids must stay below this so the two offset ranges never meet.
pub const FILE_SOURCE_ID_LIMIT: u32 = 500_000_000;

/// Redirect synthetic ids count down from here.
pub const REDIRECT_ID_CEILING: u32 = i32::MAX as u32;

/// Lowest id the redirect counter may reach.
pub const REDIRECT_ID_FLOOR: u32 = 2_000_000_000;

/// Upper bound on parent-chain hops before a walk is treated as a cycle
pub const PARENT_CHAIN_MAX_DEPTH: usize = 256;

/// Wiki status value for active wikis
pub const WIKI_STATUS_ACTIVE: i32 = 1;

/// Per-call timeout for the external markup converter
pub const CONVERTER_TIMEOUT_SECS: u64 = 60;

pub const DEFAULT_CONVERTER: &str = "pandoc";

/// Prefix written in front of content whose conversion timed out
pub const TIMEOUT_MARKER: &str = "<!-- CONVERSION TIMEOUT: REQUIRES MANUAL REVIEW -->";

/// Max pages converted concurrently
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Checkpoint interval in pages converted
pub const CHECKPOINT_INTERVAL: u32 = 200;

/// A checkpoint is also deferred until the converted map has grown by
/// `1 / CHECKPOINT_GROWTH_DIVISOR` since the previous one
pub const CHECKPOINT_GROWTH_DIVISOR: u32 = 10;

/// Bump when the on-disk checkpoint layout changes
pub const CHECKPOINT_VERSION: u32 = 1;

/// Contributor name used when a revision's author cannot be resolved
pub const UNKNOWN_AUTHOR: &str = "Redmine import";

/// Directory under the workspace that receives attachment payloads
pub const UPLOAD_DIR: &str = "images";

/// Progress update interval (tick every N revisions)
pub const PROGRESS_INTERVAL: u32 = 100;

/// Report of unresolved links written next to the buckets after conversion
pub const UNRESOLVED_LINKS_CSV: &str = "unresolved_links.csv";
