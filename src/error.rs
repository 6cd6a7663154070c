use thiserror::Error;

/// Source data that cannot be migrated without losing structure.
///
/// These abort the stage that finds them. Everything else (unresolved links,
/// converter trouble, missing files) is logged and recorded instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("Parent chain of page {page_id} does not reach a root")]
    CyclicParent { page_id: u32 },
    #[error("Page {page_id} references missing parent {parent_id}")]
    MissingParent { page_id: u32, parent_id: u32 },
    #[error("Revision {version} of page {page_id} does not follow its predecessor")]
    BrokenRevisionChain { page_id: u32, version: u32 },
    #[error("Title {title:?} is shared by pages {first} and {second}")]
    DuplicateTitle { title: String, first: u32, second: u32 },
    #[error("{kind} id {id} is outside its allowed range")]
    IdOutOfRange { kind: &'static str, id: u32 },
    #[error("Redirect id space exhausted")]
    IdSpaceExhausted,
}
