#![forbid(unsafe_code)]

use crate::packet::SourceKey;
use crate::request::Request;
use std::collections::HashMap;

/// Per-source record of reconstructed requests, in arrival order.
///
/// Cleanup enforces the anchor-continuity invariant: a source whose
/// in-window requests are all undecided keeps its most recent decisive
/// request alive as the chain head, so earlier deny/allow outcomes are not
/// forgotten the moment their packets age out of the retention window.
#[derive(Debug, Default)]
pub struct SourceHistory {
    entries: HashMap<SourceKey, Vec<Request>>,
}

impl SourceHistory {
    pub fn new() -> SourceHistory {
        SourceHistory::default()
    }

    pub fn requests(&self, key: &SourceKey) -> &[Request] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn push_request(&mut self, key: SourceKey, request: Request) {
        self.entries.entry(key).or_default().push(request);
    }

    /// Most recent request that the packet's sequence number places inside
    /// an existing flow window.
    pub fn flow_index(&self, key: &SourceKey, seq: u32) -> Option<usize> {
        let requests = self.entries.get(key)?;
        requests.iter().rposition(|r| r.is_part_of(seq))
    }

    pub fn last_index(&self, key: &SourceKey) -> Option<usize> {
        let requests = self.entries.get(key)?;
        requests.len().checked_sub(1)
    }

    pub fn request_mut(&mut self, key: &SourceKey, index: usize) -> Option<&mut Request> {
        self.entries.get_mut(key)?.get_mut(index)
    }

    /// Id of the most recent decisive request, used as the `previous_id`
    /// of a newly created request.
    pub fn last_decisive_id(&self, key: &SourceKey) -> Option<u64> {
        self.requests(key)
            .iter()
            .rev()
            .find(|r| r.is_decisive())
            .map(|r| r.id)
    }

    /// Requests whose flow started within `window` seconds of `now`.
    pub fn count_recent(&self, key: &SourceKey, now: f64, window: u64) -> u64 {
        self.requests(key)
            .iter()
            .filter(|r| now - r.current_time() < window as f64)
            .count() as u64
    }

    pub fn source_count(&self) -> usize {
        self.entries.len()
    }

    /// Prunes requests older than their retention horizon and returns
    /// them. When pruning would leave a source with no decisive request in
    /// the window, the most recent decisive pruned request is promoted
    /// back to the front as the new chain head: its `previous_id` is
    /// cleared and retained requests that pointed at the old head are
    /// re-pointed to it. Calling this twice with the same `now` prunes
    /// nothing the second time.
    pub fn clean(&mut self, now: f64) -> Vec<Request> {
        let mut all_pruned = Vec::new();
        let mut empty_keys = Vec::new();

        for (key, requests) in self.entries.iter_mut() {
            let old_head_id = requests.first().map(|r| r.id);
            let mut pruned = Vec::new();
            let mut retained = Vec::new();
            for request in requests.drain(..) {
                if now - request.current_time() < request.max_time() as f64 {
                    retained.push(request);
                } else {
                    pruned.push(request);
                }
            }

            if !retained.iter().any(Request::is_decisive) {
                if let Some(pos) = pruned.iter().rposition(Request::is_decisive) {
                    let mut anchor = pruned.remove(pos);
                    anchor.previous_id = None;
                    for request in retained.iter_mut() {
                        if request.previous_id.is_some() && request.previous_id == old_head_id {
                            request.previous_id = Some(anchor.id);
                        }
                    }
                    retained.insert(0, anchor);
                }
            }

            *requests = retained;
            all_pruned.append(&mut pruned);
            if requests.is_empty() {
                empty_keys.push(*key);
            }
        }

        for key in empty_keys {
            self.entries.remove(&key);
        }
        all_pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::tests::build_ipv4_tcp;
    use crate::packet::ParsedPacket;
    use crate::rules::RuleKind;

    fn key() -> SourceKey {
        SourceKey {
            ip: "10.0.0.5".parse().expect("ip"),
            port: 8091,
            protocol: packet_parser::IpProtocol::Tcp,
        }
    }

    fn denied(id: u64, previous_id: Option<u64>, at: f64) -> Request {
        let raw = build_ipv4_tcp([10, 0, 0, 5], [10, 0, 0, 1], 40000, 8091, 100, 0x02, b"");
        let mut packet = ParsedPacket::parse(&raw, at, 1);
        packet.set_deny(Some(RuleKind::Deny), "Deny ip".into(), 30);
        let mut request = Request::new(id, previous_id);
        request.push(packet);
        request
    }

    fn undecided(id: u64, previous_id: Option<u64>, at: f64) -> Request {
        let raw = build_ipv4_tcp([10, 0, 0, 5], [10, 0, 0, 1], 40000, 8091, 100, 0x02, b"");
        let mut request = Request::new(id, previous_id);
        request.push(ParsedPacket::parse(&raw, at, 1));
        request
    }

    #[test]
    fn prunes_requests_past_their_horizon() {
        let mut history = SourceHistory::new();
        history.push_request(key(), denied(1, None, 0.0));
        history.push_request(key(), denied(2, Some(1), 100.0));

        // id 1 has a 30 s horizon; at t=100 it falls out, id 2 stays but
        // id 2 is decisive so no anchor promotion happens.
        let pruned = history.clean(100.0);
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].id, 1);
        assert_eq!(history.requests(&key()).len(), 1);
    }

    #[test]
    fn promotes_the_last_decisive_request_as_anchor() {
        let mut history = SourceHistory::new();
        history.push_request(key(), denied(1, None, 0.0));
        history.push_request(key(), undecided(2, Some(1), 95.0));
        history.push_request(key(), undecided(3, Some(1), 98.0));

        let pruned = history.clean(100.0);
        assert!(pruned.is_empty());
        let retained = history.requests(&key());
        assert_eq!(retained.len(), 3);
        assert_eq!(retained[0].id, 1);
        assert_eq!(retained[0].previous_id, None);
        assert_eq!(retained[1].previous_id, Some(1));
        assert!(retained[0].is_denied());
    }

    #[test]
    fn repoints_requests_at_the_promoted_anchor() {
        let mut history = SourceHistory::new();
        // the old chain head (id 1) ages out undecided; id 2 is the
        // decisive request promoted in its place
        history.push_request(key(), undecided(1, None, 0.0));
        history.push_request(key(), denied(2, Some(1), 1.0));
        history.push_request(key(), undecided(3, Some(1), 95.0));

        history.clean(130.0);
        let retained = history.requests(&key());
        assert_eq!(retained.len(), 2);
        assert_eq!(retained[0].id, 2);
        assert_eq!(retained[0].previous_id, None);
        assert_eq!(retained[1].id, 3);
        assert_eq!(retained[1].previous_id, Some(2));
    }

    #[test]
    fn cleanup_is_idempotent() {
        let mut history = SourceHistory::new();
        history.push_request(key(), denied(1, None, 0.0));
        history.push_request(key(), undecided(2, Some(1), 95.0));

        let first = history.clean(100.0);
        let retained_after_first: Vec<u64> =
            history.requests(&key()).iter().map(|r| r.id).collect();
        let second = history.clean(100.0);
        let retained_after_second: Vec<u64> =
            history.requests(&key()).iter().map(|r| r.id).collect();

        assert!(first.is_empty());
        assert!(second.is_empty());
        assert_eq!(retained_after_first, retained_after_second);
    }

    #[test]
    fn drops_sources_with_nothing_left() {
        let mut history = SourceHistory::new();
        history.push_request(key(), undecided(1, None, 0.0));
        let pruned = history.clean(10_000.0);
        assert_eq!(pruned.len(), 1);
        assert_eq!(history.source_count(), 0);
    }
}
