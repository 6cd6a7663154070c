//! Synthetic id allocation.
//!
//! Native ids live below [`ATTACHMENT_ID_OFFSET`]. Attachment and diagram pages
//! take their source id plus a fixed offset, and redirect pages count down from
//! [`REDIRECT_ID_CEILING`]. The ranges are disjoint:
//!
//! ```text
//! [0, 1e9)            native pages and revisions
//! [1e9, 1.5e9)        attachment pages
//! [1.5e9, 2e9)        diagram pages
//! [2e9, i32::MAX]     redirect pages and revisions
//! ```

use crate::config::{
    ATTACHMENT_ID_OFFSET, DIAGRAM_ID_OFFSET, FILE_SOURCE_ID_LIMIT, REDIRECT_ID_CEILING,
    REDIRECT_ID_FLOOR,
};
use crate::error::IntegrityError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdClass {
    Native,
    Attachment,
    Diagram,
    Redirect,
}

pub fn classify(id: u32) -> Option<IdClass> {
    match id {
        _ if id < ATTACHMENT_ID_OFFSET => Some(IdClass::Native),
        _ if id < DIAGRAM_ID_OFFSET => Some(IdClass::Attachment),
        _ if id < REDIRECT_ID_FLOOR => Some(IdClass::Diagram),
        _ if id <= REDIRECT_ID_CEILING => Some(IdClass::Redirect),
        _ => None,
    }
}

pub fn check_native(id: u32) -> Result<u32, IntegrityError> {
    if id < ATTACHMENT_ID_OFFSET {
        Ok(id)
    } else {
        Err(IntegrityError::IdOutOfRange { kind: "Native", id })
    }
}

pub fn attachment_page_id(attachment_id: u32) -> Result<u32, IntegrityError> {
    if attachment_id >= FILE_SOURCE_ID_LIMIT {
        return Err(IntegrityError::IdOutOfRange {
            kind: "Attachment",
            id: attachment_id,
        });
    }
    Ok(ATTACHMENT_ID_OFFSET + attachment_id)
}

pub fn diagram_page_id(diagram_id: u32) -> Result<u32, IntegrityError> {
    if diagram_id >= FILE_SOURCE_ID_LIMIT {
        return Err(IntegrityError::IdOutOfRange {
            kind: "Diagram",
            id: diagram_id,
        });
    }
    Ok(DIAGRAM_ID_OFFSET + diagram_id)
}

/// Descending counter for redirect pages and revisions.
///
/// Allocation order is the only input, so a rerun over the same redirect rows
/// hands out the same ids.
#[derive(Debug, Default)]
pub struct RedirectIds {
    issued: u32,
}

impl RedirectIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> Result<u32, IntegrityError> {
        let id = REDIRECT_ID_CEILING
            .checked_sub(self.issued)
            .filter(|id| *id >= REDIRECT_ID_FLOOR)
            .ok_or(IntegrityError::IdSpaceExhausted)?;
        self.issued += 1;
        Ok(id)
    }

    pub fn issued(&self) -> u32 {
        self.issued
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_ids_below_offset_pass() {
        assert_eq!(check_native(42), Ok(42));
        assert!(check_native(ATTACHMENT_ID_OFFSET).is_err());
    }

    #[test]
    fn file_ids_land_in_their_own_ranges() {
        let attachment = attachment_page_id(FILE_SOURCE_ID_LIMIT - 1).unwrap();
        let diagram = diagram_page_id(0).unwrap();
        assert_eq!(classify(attachment), Some(IdClass::Attachment));
        assert_eq!(classify(diagram), Some(IdClass::Diagram));
        assert!(attachment < diagram);
        assert!(attachment_page_id(FILE_SOURCE_ID_LIMIT).is_err());
        assert!(diagram_page_id(FILE_SOURCE_ID_LIMIT).is_err());
    }

    #[test]
    fn redirect_ids_descend_from_ceiling() {
        let mut ids = RedirectIds::new();
        let first = ids.next_id().unwrap();
        let second = ids.next_id().unwrap();
        assert_eq!(first, REDIRECT_ID_CEILING);
        assert_eq!(second, REDIRECT_ID_CEILING - 1);
        assert_eq!(classify(first), Some(IdClass::Redirect));
        assert_eq!(ids.issued(), 2);
    }

    #[test]
    fn redirect_ids_stop_at_floor() {
        let mut ids = RedirectIds {
            issued: REDIRECT_ID_CEILING - REDIRECT_ID_FLOOR,
        };
        assert_eq!(ids.next_id(), Ok(REDIRECT_ID_FLOOR));
        assert_eq!(ids.next_id(), Err(IntegrityError::IdSpaceExhausted));
    }

    #[test]
    fn classify_rejects_above_ceiling() {
        assert_eq!(classify(0), Some(IdClass::Native));
        assert_eq!(classify(REDIRECT_ID_CEILING + 1), None);
    }
}
