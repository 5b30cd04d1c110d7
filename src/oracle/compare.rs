//! oracle::compare
//!
//! Equivalence of two delegates' answers.
//!
//! Two backends never agree on zxids, timestamps or session ids, so those are
//! left out. What remains is what a client can rely on across backends:
//! error codes, versions, counts, data and membership.

use crate::personality::Session;
use crate::proto::{Reply, Response, Stat, ZkError};

/// Both answers to one call and whether they agree.
#[derive(Debug, Clone, Copy)]
pub struct ComparisonResult<'a, T> {
    pub reference: &'a T,
    pub candidate: &'a T,
    pub matched: bool,
}

impl<'a> ComparisonResult<'a, Result<Reply, ZkError>> {
    pub fn of_replies(
        reference: &'a Result<Reply, ZkError>,
        candidate: &'a Result<Reply, ZkError>,
    ) -> Self {
        let matched = match (reference, candidate) {
            (Err(a), Err(b)) => a == b,
            (Ok(a), Ok(b)) => responses_match(&a.response, &b.response),
            _ => false,
        };
        Self {
            reference,
            candidate,
            matched,
        }
    }
}

impl<'a> ComparisonResult<'a, Result<Session, ZkError>> {
    pub fn of_sessions(
        reference: &'a Result<Session, ZkError>,
        candidate: &'a Result<Session, ZkError>,
    ) -> Self {
        let matched = match (reference, candidate) {
            (Err(a), Err(b)) => a == b,
            (Ok(a), Ok(b)) => a.timeout_ms == b.timeout_ms && a.read_only == b.read_only,
            _ => false,
        };
        Self {
            reference,
            candidate,
            matched,
        }
    }
}

/// Stat fields that are stable across backends.
pub fn stats_match(a: &Stat, b: &Stat) -> bool {
    a.version == b.version
        && a.cversion == b.cversion
        && a.aversion == b.aversion
        && a.data_length == b.data_length
        && a.num_children == b.num_children
        && (a.ephemeral_owner != 0) == (b.ephemeral_owner != 0)
}

fn same_members(a: &[String], b: &[String]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    b.sort();
    a == b
}

pub fn responses_match(a: &Response, b: &Response) -> bool {
    use Response::*;
    match (a, b) {
        (Create { path: a }, Create { path: b }) => a == b,
        (Delete, Delete) | (Ping, Ping) | (CloseSession, CloseSession) => true,
        (Exists { stat: a }, Exists { stat: b })
        | (SetData { stat: a }, SetData { stat: b })
        | (SetAcl { stat: a }, SetAcl { stat: b }) => stats_match(a, b),
        (
            GetData {
                data: da,
                stat: sa,
            },
            GetData {
                data: db,
                stat: sb,
            },
        ) => da == db && stats_match(sa, sb),
        (GetAcl { acl: aa, stat: sa }, GetAcl { acl: ab, stat: sb }) => {
            aa == ab && stats_match(sa, sb)
        }
        (GetChildren { children: a }, GetChildren { children: b }) => same_members(a, b),
        (
            GetChildren2 {
                children: ca,
                stat: sa,
            },
            GetChildren2 {
                children: cb,
                stat: sb,
            },
        ) => same_members(ca, cb) && stats_match(sa, sb),
        (Sync { path: a }, Sync { path: b }) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(version: i32, owner: i64, czxid: i64) -> Stat {
        Stat {
            version,
            ephemeral_owner: owner,
            czxid,
            mzxid: czxid,
            ..Stat::default()
        }
    }

    #[test]
    fn zxids_and_owner_ids_are_ignored() {
        assert!(stats_match(&stat(1, 7, 100), &stat(1, 99, 3)));
        assert!(!stats_match(&stat(1, 7, 100), &stat(1, 0, 100)));
        assert!(!stats_match(&stat(1, 0, 1), &stat(2, 0, 1)));
    }

    #[test]
    fn children_compare_as_sets() {
        let a = Response::GetChildren {
            children: vec!["x".into(), "y".into()],
        };
        let b = Response::GetChildren {
            children: vec!["y".into(), "x".into()],
        };
        let c = Response::GetChildren {
            children: vec!["x".into()],
        };
        assert!(responses_match(&a, &b));
        assert!(!responses_match(&a, &c));
    }

    #[test]
    fn errors_match_by_code() {
        let a: Result<Reply, ZkError> = Err(ZkError::NoNode);
        let b: Result<Reply, ZkError> = Err(ZkError::NoNode);
        let c: Result<Reply, ZkError> = Err(ZkError::NodeExists);
        let ok: Result<Reply, ZkError> = Ok(Reply::new(1, Response::Delete));
        assert!(ComparisonResult::of_replies(&a, &b).matched);
        assert!(!ComparisonResult::of_replies(&a, &c).matched);
        assert!(!ComparisonResult::of_replies(&a, &ok).matched);
    }

    #[test]
    fn reply_zxids_are_ignored() {
        let a: Result<Reply, ZkError> = Ok(Reply::new(1, Response::Delete));
        let b: Result<Reply, ZkError> = Ok(Reply::new(900, Response::Delete));
        assert!(ComparisonResult::of_replies(&a, &b).matched);
    }

    #[test]
    fn sessions_ignore_ids() {
        let session = |id, timeout_ms| Session {
            id,
            timeout_ms,
            password: vec![id as u8; 16],
            read_only: false,
        };
        let a = Ok(session(1, 4_000));
        let b = Ok(session(2, 4_000));
        let c = Ok(session(2, 6_000));
        assert!(ComparisonResult::of_sessions(&a, &b).matched);
        assert!(!ComparisonResult::of_sessions(&a, &c).matched);
        assert!(!ComparisonResult::of_sessions(&a, &Err(ZkError::SessionExpired)).matched);
    }

    #[test]
    fn different_response_kinds_differ() {
        assert!(!responses_match(&Response::Ping, &Response::Delete));
    }
}
