//! Raft consensus core
//!
//! A synchronous, tick-driven state machine in the style of raft-rs: callers
//! feed it ticks, peer messages and client requests, then drain the messages
//! it wants to send with [`RaftCore::take_messages`]. It never blocks and never
//! performs network I/O, which keeps it deterministic under test. Durable
//! state goes through [`LogStorage`]; any storage failure makes the replica
//! step down and refuse further work.

use crate::config::RaftConfig;
use crate::raft::entry::{
    AppendResult, ConfigChange, Configuration, EntryPayload, HardState, LogBoundary, LogEntry,
    NodeId,
};
use crate::raft::errors::{RaftError, StorageError};
use crate::raft::message::RaftMessage;
use crate::raft::snapshot::{SnapshotChunk, SnapshotDescriptor, SnapshotReplication};
use crate::raft::storage::LogStorage;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use slog::{crit, debug, info, warn, Logger};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Role, term and known leader, published on every change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RoleState {
    pub role: Role,
    pub term: u64,
    pub leader: Option<NodeId>,
}

#[derive(Clone, Debug)]
pub struct CoreConfig {
    pub id: NodeId,
    pub election_tick: u32,
    pub heartbeat_tick: u32,
    pub max_append_entries: usize,
    pub check_quorum: bool,
}

impl CoreConfig {
    pub fn from_raft_config(id: NodeId, config: &RaftConfig) -> Self {
        Self {
            id,
            election_tick: config.election_tick,
            heartbeat_tick: config.heartbeat_tick,
            max_append_entries: config.max_append_entries,
            check_quorum: true,
        }
    }
}

struct Progress {
    match_index: u64,
    next_index: u64,
    /// Heard from since the last check-quorum round.
    recent_active: bool,
    snapshot: Option<OutgoingSnapshot>,
}

impl Progress {
    fn new(next_index: u64) -> Self {
        Self {
            match_index: 0,
            next_index,
            recent_active: true,
            snapshot: None,
        }
    }
}

struct OutgoingSnapshot {
    descriptor: SnapshotDescriptor,
    next_chunk: u32,
}

struct IncomingSnapshot {
    id: String,
    next_chunk: u32,
}

struct LeaderTransfer {
    target: NodeId,
    elapsed: u32,
}

pub struct RaftCore {
    cfg: CoreConfig,
    storage: Arc<dyn LogStorage>,
    snapshots: Arc<dyn SnapshotReplication>,

    role: Role,
    term: u64,
    vote: Option<NodeId>,
    leader_id: Option<NodeId>,
    commit: u64,
    commit_position: i64,

    /// Latest configuration in the log, committed or not.
    configuration: Configuration,
    pending_config_index: u64,

    election_elapsed: u32,
    randomized_election_timeout: u32,
    heartbeat_elapsed: u32,

    votes: BTreeMap<NodeId, bool>,
    progress: BTreeMap<NodeId, Progress>,
    transfer: Option<LeaderTransfer>,
    incoming_snapshot: Option<IncomingSnapshot>,

    msgs: Vec<(NodeId, RaftMessage)>,
    installed_snapshot: Option<SnapshotDescriptor>,
    fatal: Option<String>,
    rng: StdRng,
    logger: Logger,
}

impl RaftCore {
    pub fn new(
        cfg: CoreConfig,
        storage: Arc<dyn LogStorage>,
        snapshots: Arc<dyn SnapshotReplication>,
        logger: Logger,
    ) -> Result<Self, StorageError> {
        let hs = storage.hard_state();
        let boundary = storage.boundary();
        let commit = hs.commit.max(boundary.index).min(storage.last_index());
        let rng = StdRng::seed_from_u64(rand::random::<u64>() ^ cfg.id);

        let mut core = Self {
            cfg,
            storage,
            snapshots,
            role: Role::Follower,
            term: hs.term,
            vote: hs.vote,
            leader_id: None,
            commit,
            commit_position: boundary.position,
            configuration: Configuration::default(),
            pending_config_index: 0,
            election_elapsed: 0,
            randomized_election_timeout: 0,
            heartbeat_elapsed: 0,
            votes: BTreeMap::new(),
            progress: BTreeMap::new(),
            transfer: None,
            incoming_snapshot: None,
            msgs: Vec::new(),
            installed_snapshot: None,
            fatal: None,
            rng,
            logger,
        };
        core.commit_position = core.position_at(commit)?;
        core.reload_configuration()?;
        core.reset_election_timer();
        Ok(core)
    }

    pub fn id(&self) -> NodeId {
        self.cfg.id
    }

    pub fn role_state(&self) -> RoleState {
        RoleState {
            role: self.role,
            term: self.term,
            leader: self.leader_id,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn commit_index(&self) -> u64 {
        self.commit
    }

    /// Highest record position in a committed entry.
    pub fn commit_position(&self) -> i64 {
        self.commit_position
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn first_index(&self) -> u64 {
        self.storage.first_index()
    }

    pub fn last_index(&self) -> u64 {
        self.storage.last_index()
    }

    pub fn fatal_error(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    pub fn take_messages(&mut self) -> Vec<(NodeId, RaftMessage)> {
        std::mem::take(&mut self.msgs)
    }

    /// Snapshot installed from the leader since the last call.
    pub fn take_installed_snapshot(&mut self) -> Option<SnapshotDescriptor> {
        self.installed_snapshot.take()
    }

    // ---------------------------------------------------------------------
    // Driving the core
    // ---------------------------------------------------------------------

    pub fn tick(&mut self) {
        if self.fatal.is_some() {
            return;
        }
        match self.role {
            Role::Leader => self.tick_leader(),
            Role::Follower | Role::Candidate => {
                self.election_elapsed += 1;
                if self.election_elapsed >= self.randomized_election_timeout
                    && self.configuration.contains(self.cfg.id)
                {
                    self.start_election(false);
                }
            }
        }
    }

    fn tick_leader(&mut self) {
        self.heartbeat_elapsed += 1;
        self.election_elapsed += 1;

        if self.election_elapsed >= self.cfg.election_tick {
            self.election_elapsed = 0;
            if self.cfg.check_quorum {
                let active = self
                    .configuration
                    .voters
                    .iter()
                    .filter(|id| {
                        **id == self.cfg.id
                            || self.progress.get(id).map(|p| p.recent_active).unwrap_or(false)
                    })
                    .count();
                if active < self.configuration.quorum() {
                    warn!(self.logger, "Leader lost contact with a quorum, stepping down";
                        "term" => self.term, "active" => active);
                    self.become_follower(self.term, None);
                    return;
                }
            }
            for pr in self.progress.values_mut() {
                pr.recent_active = false;
            }
        }

        if let Some(transfer) = &mut self.transfer {
            transfer.elapsed += 1;
            if transfer.elapsed >= self.cfg.election_tick {
                warn!(self.logger, "Leadership transfer timed out"; "target" => transfer.target);
                self.transfer = None;
            }
        }

        if self.heartbeat_elapsed >= self.cfg.heartbeat_tick {
            self.heartbeat_elapsed = 0;
            self.broadcast_append();
        }
    }

    /// Start an election immediately.
    pub fn campaign(&mut self) {
        self.start_election(false);
    }

    pub fn step(&mut self, from: NodeId, msg: RaftMessage) {
        if self.fatal.is_some() {
            return;
        }

        let msg_term = msg.term();
        if msg_term > self.term {
            if let RaftMessage::RequestVote { transfer: false, .. } = &msg {
                if self.in_leader_lease() {
                    debug!(self.logger, "Ignoring vote request while the leader is alive";
                        "from" => from, "term" => msg_term);
                    return;
                }
            }
            let leader = if msg.is_from_leader() { Some(from) } else { None };
            self.become_follower(msg_term, leader);
            if self.fatal.is_some() {
                return;
            }
        } else if msg_term < self.term {
            match msg {
                RaftMessage::AppendEntries { .. } | RaftMessage::InstallSnapshot { .. } => {
                    self.send(
                        from,
                        RaftMessage::AppendResponse {
                            term: self.term,
                            success: false,
                            match_index: 0,
                            reject_hint: 0,
                        },
                    );
                }
                RaftMessage::RequestVote { .. } => {
                    self.send(
                        from,
                        RaftMessage::VoteResponse {
                            term: self.term,
                            granted: false,
                        },
                    );
                }
                _ => {}
            }
            return;
        }

        match msg {
            RaftMessage::RequestVote {
                last_log_index,
                last_log_term,
                ..
            } => self.handle_vote_request(from, last_log_index, last_log_term),
            RaftMessage::VoteResponse { granted, .. } => self.handle_vote_response(from, granted),
            RaftMessage::AppendEntries {
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                ..
            } => {
                if !self.accept_leader(from) {
                    return;
                }
                self.handle_append_entries(from, prev_log_index, prev_log_term, entries, leader_commit);
            }
            RaftMessage::AppendResponse {
                success,
                match_index,
                reject_hint,
                ..
            } => {
                if self.role == Role::Leader {
                    self.handle_append_response(from, success, match_index, reject_hint);
                }
            }
            RaftMessage::InstallSnapshot { snapshot, chunk, .. } => {
                if !self.accept_leader(from) {
                    return;
                }
                self.handle_install_snapshot(from, snapshot, chunk);
            }
            RaftMessage::InstallSnapshotResponse {
                snapshot_id,
                success,
                next_chunk,
                done,
                ..
            } => {
                if self.role == Role::Leader {
                    self.handle_snapshot_response(from, &snapshot_id, success, next_chunk, done);
                }
            }
            RaftMessage::TimeoutNow { .. } => {
                if self.configuration.contains(self.cfg.id) {
                    info!(self.logger, "Received TimeoutNow, campaigning"; "from" => from);
                    self.start_election(true);
                }
            }
        }
    }

    /// Append a batch of `record_count` records on the leader.
    ///
    /// Positions continue gap-free from the log tail. Returns once the entry is
    /// durable locally; replication proceeds asynchronously.
    pub fn propose(&mut self, record_count: u64, data: Bytes) -> Result<AppendResult, RaftError> {
        self.check_can_propose()?;
        let lowest_position = self.storage.last_position() + 1;
        let highest_position = lowest_position + record_count.max(1) as i64 - 1;

        let index = self
            .append_local(EntryPayload::Application {
                lowest_position,
                highest_position,
                data,
            })
            .ok_or_else(|| self.fatal_result())?;

        self.maybe_commit();
        self.broadcast_append();
        Ok(AppendResult {
            index,
            lowest_position,
            highest_position,
        })
    }

    /// Hand leadership to `target` once it has caught up. Proposals are refused
    /// until the transfer completes or times out after one election timeout.
    pub fn transfer_leadership(&mut self, target: NodeId) -> Result<(), RaftError> {
        self.check_can_propose()?;
        if target == self.cfg.id {
            return Ok(());
        }
        if !self.configuration.contains(target) {
            return Err(RaftError::NotAVoter { node_id: target });
        }

        info!(self.logger, "Transferring leadership"; "target" => target, "term" => self.term);
        self.transfer = Some(LeaderTransfer { target, elapsed: 0 });
        let last_index = self.storage.last_index();
        let caught_up = self
            .progress
            .get(&target)
            .map(|p| p.match_index == last_index)
            .unwrap_or(false);
        if caught_up {
            self.send(target, RaftMessage::TimeoutNow { term: self.term });
        } else {
            self.send_append(target);
        }
        Ok(())
    }

    /// Propose a single-server membership change. Only one change may be
    /// uncommitted at a time. Returns the index of the configuration entry.
    pub fn change_config(&mut self, change: ConfigChange) -> Result<u64, RaftError> {
        self.check_can_propose()?;
        if self.pending_config_index > self.commit {
            return Err(RaftError::ConfigChangeInProgress);
        }

        let mut next = self.configuration.clone();
        match change {
            ConfigChange::AddVoter(id) => {
                if !next.voters.insert(id) {
                    return Err(RaftError::InvalidConfigChange(format!("{} is already a voter", id)));
                }
            }
            ConfigChange::RemoveVoter(id) => {
                if !next.voters.remove(&id) {
                    return Err(RaftError::NotAVoter { node_id: id });
                }
                if next.voters.is_empty() {
                    return Err(RaftError::InvalidConfigChange("cannot remove the last voter".into()));
                }
            }
        }

        info!(self.logger, "Proposing configuration change"; "change" => ?change);
        let index = self
            .append_local(EntryPayload::Config(next))
            .ok_or_else(|| self.fatal_result())?;
        self.pending_config_index = index;
        self.maybe_commit();
        self.broadcast_append();
        Ok(index)
    }

    /// Discard log entries up to `index`, never beyond the commit index.
    /// Returns the new first index.
    pub fn compact(&mut self, index: u64) -> Result<u64, RaftError> {
        if self.fatal.is_some() {
            return Err(self.fatal_result());
        }
        let through = index.min(self.commit);
        if through >= self.storage.first_index() {
            if let Err(e) = self.storage.compact(through) {
                self.fail(e);
                return Err(self.fatal_result());
            }
            info!(self.logger, "Compacted log"; "through" => through);
        }
        Ok(self.storage.first_index())
    }

    /// The highest committed entry whose records all have positions `<= position`:
    /// the log coordinates of a snapshot covering state up to `position`.
    pub fn boundary_for_position(&mut self, position: i64) -> Result<Option<LogBoundary>, RaftError> {
        let first = self.storage.first_index();
        let mut index = self.commit;
        while index >= first {
            let entry = match self.storage.entry(index) {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    self.fail(e);
                    return Err(self.fatal_result());
                }
            };
            if let Some(highest) = entry.highest_position() {
                if highest <= position {
                    return Ok(Some(LogBoundary {
                        index,
                        term: entry.term,
                        position: highest,
                    }));
                }
            }
            index -= 1;
        }

        let boundary = self.storage.boundary();
        if boundary.index > 0 && boundary.position <= position {
            Ok(Some(boundary))
        } else {
            Ok(None)
        }
    }

    // ---------------------------------------------------------------------
    // Role transitions
    // ---------------------------------------------------------------------

    fn become_follower(&mut self, term: u64, leader: Option<NodeId>) {
        let was = self.role;
        if term > self.term {
            self.term = term;
            self.vote = None;
            if !self.persist_hard_state() {
                return;
            }
        }
        self.role = Role::Follower;
        self.leader_id = leader;
        self.votes.clear();
        self.progress.clear();
        self.transfer = None;
        self.reset_election_timer();
        if was != Role::Follower {
            info!(self.logger, "Became follower"; "term" => self.term, "leader" => ?leader);
        }
    }

    fn start_election(&mut self, transfer: bool) {
        if self.fatal.is_some() || !self.configuration.contains(self.cfg.id) {
            return;
        }
        let (last_log_index, last_log_term) = match self.last_log_id() {
            Some(id) => id,
            None => return,
        };

        self.term += 1;
        self.vote = Some(self.cfg.id);
        self.role = Role::Candidate;
        self.leader_id = None;
        self.progress.clear();
        self.transfer = None;
        self.reset_election_timer();
        if !self.persist_hard_state() {
            return;
        }

        info!(self.logger, "Starting election"; "term" => self.term, "transfer" => transfer);
        self.votes.clear();
        self.votes.insert(self.cfg.id, true);
        if self.configuration.quorum() <= 1 {
            self.become_leader();
            return;
        }

        for peer in self.peers() {
            self.send(
                peer,
                RaftMessage::RequestVote {
                    term: self.term,
                    last_log_index,
                    last_log_term,
                    transfer,
                },
            );
        }
    }

    fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.leader_id = Some(self.cfg.id);
        self.heartbeat_elapsed = 0;
        self.election_elapsed = 0;
        self.transfer = None;

        let next_index = self.storage.last_index() + 1;
        self.progress = self
            .peers()
            .into_iter()
            .map(|peer| (peer, Progress::new(next_index)))
            .collect();
        info!(self.logger, "Became leader"; "term" => self.term, "last_index" => next_index - 1);

        // Entries of earlier terms commit only through an entry of this term.
        if self.append_local(EntryPayload::Noop).is_none() {
            return;
        }
        self.maybe_commit();
        self.broadcast_append();
    }

    /// Handle a message identifying `from` as leader of the current term.
    fn accept_leader(&mut self, from: NodeId) -> bool {
        match self.role {
            Role::Leader => {
                crit!(self.logger, "Two leaders in one term"; "term" => self.term, "other" => from);
                false
            }
            Role::Candidate => {
                self.become_follower(self.term, Some(from));
                self.fatal.is_none()
            }
            Role::Follower => {
                self.leader_id = Some(from);
                self.election_elapsed = 0;
                true
            }
        }
    }

    fn in_leader_lease(&self) -> bool {
        self.role == Role::Leader
            || (self.leader_id.is_some() && self.election_elapsed < self.cfg.election_tick)
    }

    // ---------------------------------------------------------------------
    // Elections
    // ---------------------------------------------------------------------

    fn handle_vote_request(&mut self, from: NodeId, last_log_index: u64, last_log_term: u64) {
        let (my_index, my_term) = match self.last_log_id() {
            Some(id) => id,
            None => return,
        };
        let up_to_date =
            last_log_term > my_term || (last_log_term == my_term && last_log_index >= my_index);
        let can_vote = self.vote.is_none() || self.vote == Some(from);
        let granted = can_vote && up_to_date;

        if granted {
            self.vote = Some(from);
            // The vote must be durable before the candidate hears about it.
            if !self.persist_hard_state() {
                return;
            }
            self.election_elapsed = 0;
        }
        debug!(self.logger, "Answering vote request";
            "candidate" => from, "term" => self.term, "granted" => granted);
        self.send(
            from,
            RaftMessage::VoteResponse {
                term: self.term,
                granted,
            },
        );
    }

    fn handle_vote_response(&mut self, from: NodeId, granted: bool) {
        if self.role != Role::Candidate || !self.configuration.contains(from) {
            return;
        }
        self.votes.insert(from, granted);
        let yes = self.votes.values().filter(|g| **g).count();
        let no = self.votes.len() - yes;
        let quorum = self.configuration.quorum();
        if yes >= quorum {
            self.become_leader();
        } else if no >= quorum {
            self.become_follower(self.term, None);
        }
    }

    // ---------------------------------------------------------------------
    // Log replication, follower side
    // ---------------------------------------------------------------------

    fn handle_append_entries(
        &mut self,
        from: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        mut entries: Vec<LogEntry>,
        leader_commit: u64,
    ) {
        let mut prev_index = prev_log_index;
        let mut prev_term = prev_log_term;

        // Everything up to our commit index is known to match the leader.
        if prev_index < self.commit {
            let skip = (self.commit - prev_index) as usize;
            if skip >= entries.len() {
                let match_index = prev_index + entries.len() as u64;
                self.reply_append(from, true, match_index, 0);
                return;
            }
            prev_term = entries[skip - 1].term;
            prev_index = self.commit;
            entries.drain(..skip);
        }

        let last_index = self.storage.last_index();
        if prev_index > last_index {
            self.reply_append(from, false, 0, last_index + 1);
            return;
        }

        let local_prev_term = match self.storage.term(prev_index) {
            Ok(Some(term)) => term,
            Ok(None) => {
                self.reply_append(from, false, 0, self.commit + 1);
                return;
            }
            Err(e) => return self.fail(e),
        };
        if local_prev_term != prev_term {
            if prev_index <= self.commit {
                return self.fail_consistency(format!(
                    "committed entry {} has term {} locally but {} on leader {}",
                    prev_index, local_prev_term, prev_term, from
                ));
            }
            // Skip back over the whole conflicting term, never below the commit index.
            let mut hint = prev_index;
            while hint > self.commit + 1 {
                match self.storage.term(hint - 1) {
                    Ok(Some(term)) if term == local_prev_term => hint -= 1,
                    Ok(_) => break,
                    Err(e) => return self.fail(e),
                }
            }
            self.reply_append(from, false, 0, hint);
            return;
        }

        let match_index = prev_index + entries.len() as u64;
        let mut append_from = None;
        for (i, entry) in entries.iter().enumerate() {
            if entry.index > last_index {
                append_from = Some(i);
                break;
            }
            match self.storage.term(entry.index) {
                Ok(Some(term)) if term == entry.term => continue,
                Ok(_) => {
                    if entry.index <= self.commit {
                        return self.fail_consistency(format!(
                            "leader {} tried to overwrite committed entry {}",
                            from, entry.index
                        ));
                    }
                    warn!(self.logger, "Truncating divergent log suffix";
                        "from_index" => entry.index, "last_index" => last_index);
                    if let Err(e) = self.storage.truncate_suffix(entry.index) {
                        return self.fail(e);
                    }
                    if let Err(e) = self.reload_configuration() {
                        return self.fail(e);
                    }
                    append_from = Some(i);
                    break;
                }
                Err(e) => return self.fail(e),
            }
        }

        if let Some(i) = append_from {
            let new_entries = &entries[i..];
            if let Err(e) = self.storage.append(new_entries) {
                return self.fail(e);
            }
            for entry in new_entries {
                if let EntryPayload::Config(configuration) = &entry.payload {
                    self.apply_configuration(configuration.clone());
                    self.pending_config_index = entry.index;
                }
            }
        }

        let new_commit = leader_commit.min(match_index);
        if new_commit > self.commit {
            self.advance_commit(new_commit);
            if self.fatal.is_some() {
                return;
            }
        }
        self.reply_append(from, true, match_index, 0);
    }

    fn reply_append(&mut self, to: NodeId, success: bool, match_index: u64, reject_hint: u64) {
        self.send(
            to,
            RaftMessage::AppendResponse {
                term: self.term,
                success,
                match_index,
                reject_hint,
            },
        );
    }

    fn handle_install_snapshot(&mut self, from: NodeId, snapshot: SnapshotDescriptor, chunk: SnapshotChunk) {
        if snapshot.boundary.index <= self.commit {
            self.incoming_snapshot = None;
            self.reply_snapshot(from, &snapshot.id, true, chunk.total, true);
            return;
        }

        let expected = match &self.incoming_snapshot {
            Some(incoming) if incoming.id == snapshot.id => incoming.next_chunk,
            _ => 0,
        };
        if chunk.index != expected {
            self.reply_snapshot(from, &snapshot.id, true, expected, false);
            return;
        }

        if expected == 0 {
            if let Some(previous) = self.incoming_snapshot.take() {
                self.snapshots.abort_receive(&previous.id);
            }
            info!(self.logger, "Receiving snapshot"; "snapshot" => &snapshot.id, "leader" => from);
            if let Err(e) = self.snapshots.begin_receive(&snapshot) {
                warn!(self.logger, "Failed to start snapshot receive"; "error" => e);
                self.reply_snapshot(from, &snapshot.id, false, 0, false);
                return;
            }
        }

        let written = if chunk.verify() {
            self.snapshots.write_chunk(&snapshot, &chunk)
        } else {
            Err(format!("checksum mismatch in chunk {}", chunk.index))
        };
        if let Err(e) = written {
            warn!(self.logger, "Failed to write snapshot chunk"; "error" => e);
            self.snapshots.abort_receive(&snapshot.id);
            self.incoming_snapshot = None;
            self.reply_snapshot(from, &snapshot.id, false, 0, false);
            return;
        }

        if !chunk.is_last() {
            self.incoming_snapshot = Some(IncomingSnapshot {
                id: snapshot.id.clone(),
                next_chunk: expected + 1,
            });
            self.reply_snapshot(from, &snapshot.id, true, expected + 1, false);
            return;
        }

        self.incoming_snapshot = None;
        if let Err(e) = self.snapshots.complete_receive(&snapshot) {
            warn!(self.logger, "Received snapshot is invalid"; "error" => e);
            self.snapshots.abort_receive(&snapshot.id);
            self.reply_snapshot(from, &snapshot.id, false, 0, false);
            return;
        }

        if let Err(e) = self.storage.reset(snapshot.boundary) {
            return self.fail(e);
        }
        if let Err(e) = self.storage.save_configuration(&snapshot.configuration) {
            return self.fail(e);
        }
        self.apply_configuration(snapshot.configuration.clone());
        self.pending_config_index = 0;
        self.commit = snapshot.boundary.index;
        self.commit_position = snapshot.boundary.position;
        if !self.persist_hard_state() {
            return;
        }

        info!(self.logger, "Installed snapshot";
            "snapshot" => &snapshot.id, "index" => snapshot.boundary.index);
        let id = snapshot.id.clone();
        self.installed_snapshot = Some(snapshot);
        self.reply_snapshot(from, &id, true, expected + 1, true);
    }

    fn reply_snapshot(&mut self, to: NodeId, snapshot_id: &str, success: bool, next_chunk: u32, done: bool) {
        self.send(
            to,
            RaftMessage::InstallSnapshotResponse {
                term: self.term,
                snapshot_id: snapshot_id.to_string(),
                success,
                next_chunk,
                done,
            },
        );
    }

    // ---------------------------------------------------------------------
    // Log replication, leader side
    // ---------------------------------------------------------------------

    fn handle_append_response(&mut self, from: NodeId, success: bool, match_index: u64, reject_hint: u64) {
        let last_index = self.storage.last_index();
        let pr = match self.progress.get_mut(&from) {
            Some(pr) => pr,
            None => return,
        };
        pr.recent_active = true;

        if success {
            pr.match_index = pr.match_index.max(match_index);
            pr.next_index = pr.match_index + 1;
            let has_more = pr.next_index <= last_index;
            let caught_up = pr.match_index == last_index;

            self.maybe_commit();
            if self.role != Role::Leader {
                return;
            }
            if caught_up && self.transfer.as_ref().map(|t| t.target) == Some(from) {
                info!(self.logger, "Transfer target caught up, sending TimeoutNow"; "target" => from);
                self.send(from, RaftMessage::TimeoutNow { term: self.term });
            } else if has_more {
                self.send_append(from);
            }
        } else {
            let lowered = reject_hint.min(pr.next_index.saturating_sub(1));
            pr.next_index = lowered.max(pr.match_index + 1).min(last_index + 1).max(1);
            self.send_append(from);
        }
    }

    fn handle_snapshot_response(&mut self, from: NodeId, snapshot_id: &str, success: bool, next_chunk: u32, done: bool) {
        let pr = match self.progress.get_mut(&from) {
            Some(pr) => pr,
            None => return,
        };
        pr.recent_active = true;
        let outgoing = match &mut pr.snapshot {
            Some(outgoing) if outgoing.descriptor.id == snapshot_id => outgoing,
            _ => return,
        };

        if done {
            let index = outgoing.descriptor.boundary.index;
            pr.snapshot = None;
            pr.match_index = pr.match_index.max(index);
            pr.next_index = pr.match_index + 1;
            info!(self.logger, "Follower installed snapshot"; "follower" => from, "index" => index);
            self.send_append(from);
        } else if success {
            outgoing.next_chunk = next_chunk;
            self.send_snapshot_chunk(from);
        } else {
            // Restarted from the first chunk on the next heartbeat.
            pr.snapshot = None;
        }
    }

    fn broadcast_append(&mut self) {
        for peer in self.peers() {
            self.send_append(peer);
        }
    }

    fn send_append(&mut self, to: NodeId) {
        let (next_index, sending_snapshot) = match self.progress.get(&to) {
            Some(pr) => (pr.next_index, pr.snapshot.is_some()),
            None => return,
        };
        if sending_snapshot {
            self.send_snapshot_chunk(to);
            return;
        }

        let prev_log_index = next_index - 1;
        let prev_log_term = match self.storage.term(prev_log_index) {
            Ok(Some(term)) => term,
            Ok(None) => {
                self.start_snapshot_transfer(to);
                return;
            }
            Err(e) => return self.fail(e),
        };

        let last_index = self.storage.last_index();
        let entries = if next_index <= last_index {
            match self
                .storage
                .entries(next_index, last_index + 1, self.cfg.max_append_entries)
            {
                Ok(entries) => entries,
                Err(StorageError::Compacted { .. }) => {
                    self.start_snapshot_transfer(to);
                    return;
                }
                Err(e) => return self.fail(e),
            }
        } else {
            Vec::new()
        };

        self.send(
            to,
            RaftMessage::AppendEntries {
                term: self.term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit,
            },
        );
    }

    fn start_snapshot_transfer(&mut self, to: NodeId) {
        let descriptor = match self.snapshots.latest() {
            Some(descriptor) => descriptor,
            None => {
                warn!(self.logger, "Follower needs compacted entries but no snapshot exists"; "follower" => to);
                return;
            }
        };
        info!(self.logger, "Sending snapshot to lagging follower";
            "follower" => to, "snapshot" => &descriptor.id);
        if let Some(pr) = self.progress.get_mut(&to) {
            pr.snapshot = Some(OutgoingSnapshot {
                descriptor,
                next_chunk: 0,
            });
        }
        self.send_snapshot_chunk(to);
    }

    fn send_snapshot_chunk(&mut self, to: NodeId) {
        let (descriptor, next_chunk) = match self.progress.get(&to).and_then(|p| p.snapshot.as_ref()) {
            Some(outgoing) => (outgoing.descriptor.clone(), outgoing.next_chunk),
            None => return,
        };
        match self.snapshots.read_chunk(&descriptor.id, next_chunk) {
            Ok(chunk) => self.send(
                to,
                RaftMessage::InstallSnapshot {
                    term: self.term,
                    snapshot: descriptor,
                    chunk,
                },
            ),
            Err(e) => {
                warn!(self.logger, "Failed to read snapshot chunk"; "error" => e, "chunk" => next_chunk);
                if let Some(pr) = self.progress.get_mut(&to) {
                    pr.snapshot = None;
                }
            }
        }
    }

    fn maybe_commit(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let last_index = self.storage.last_index();
        let mut matched: Vec<u64> = self
            .configuration
            .voters
            .iter()
            .map(|id| {
                if *id == self.cfg.id {
                    last_index
                } else {
                    self.progress.get(id).map(|p| p.match_index).unwrap_or(0)
                }
            })
            .collect();
        if matched.is_empty() {
            return;
        }
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched[self.configuration.quorum() - 1];
        if candidate <= self.commit {
            return;
        }
        match self.storage.term(candidate) {
            Ok(Some(term)) if term == self.term => self.advance_commit(candidate),
            Ok(_) => {}
            Err(e) => self.fail(e),
        }
    }

    fn advance_commit(&mut self, new_commit: u64) {
        let entries = match self.storage.entries(self.commit + 1, new_commit + 1, usize::MAX) {
            Ok(entries) => entries,
            Err(e) => return self.fail(e),
        };
        self.commit = new_commit;

        for entry in &entries {
            if let Some(position) = entry.highest_position() {
                self.commit_position = position;
            }
            if let EntryPayload::Config(configuration) = &entry.payload {
                if let Err(e) = self.storage.save_configuration(configuration) {
                    return self.fail(e);
                }
            }
        }
        if !self.persist_hard_state() {
            return;
        }

        if self.role == Role::Leader && !self.configuration.contains(self.cfg.id)
            && self.pending_config_index <= self.commit
        {
            info!(self.logger, "Removed from configuration, stepping down");
            self.become_follower(self.term, None);
        }
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    fn check_can_propose(&self) -> Result<(), RaftError> {
        if self.fatal.is_some() {
            return Err(self.fatal_result());
        }
        if self.role != Role::Leader {
            return Err(RaftError::NotLeader {
                leader: self.leader_id,
            });
        }
        if let Some(transfer) = &self.transfer {
            return Err(RaftError::TransferInProgress {
                target: transfer.target,
            });
        }
        Ok(())
    }

    fn fatal_result(&self) -> RaftError {
        RaftError::Fatal(self.fatal.clone().unwrap_or_else(|| "unknown".to_string()))
    }

    fn append_local(&mut self, payload: EntryPayload) -> Option<u64> {
        let index = self.storage.last_index() + 1;
        let configuration = match &payload {
            EntryPayload::Config(configuration) => Some(configuration.clone()),
            _ => None,
        };
        let entry = LogEntry {
            index,
            term: self.term,
            payload,
        };
        if let Err(e) = self.storage.append(&[entry]) {
            self.fail(e);
            return None;
        }
        if let Some(configuration) = configuration {
            self.apply_configuration(configuration);
        }
        Some(index)
    }

    /// Switch to `configuration`, keeping leader progress in sync with the voters.
    fn apply_configuration(&mut self, configuration: Configuration) {
        if self.role == Role::Leader {
            let next_index = self.storage.last_index() + 1;
            for id in &configuration.voters {
                if *id != self.cfg.id {
                    self.progress
                        .entry(*id)
                        .or_insert_with(|| Progress::new(next_index));
                }
            }
            self.progress.retain(|id, _| configuration.voters.contains(id));
        }
        self.configuration = configuration;
    }

    /// Recompute the effective configuration from the log tail, falling back to
    /// the last committed one.
    fn reload_configuration(&mut self) -> Result<(), StorageError> {
        let first = self.storage.first_index();
        let mut index = self.storage.last_index();
        while index >= first && index > self.commit {
            if let Some(entry) = self.storage.entry(index)? {
                if let EntryPayload::Config(configuration) = entry.payload {
                    self.configuration = configuration;
                    self.pending_config_index = index;
                    return Ok(());
                }
            }
            index -= 1;
        }
        self.configuration = self.storage.configuration();
        self.pending_config_index = 0;
        Ok(())
    }

    fn position_at(&self, index: u64) -> Result<i64, StorageError> {
        let first = self.storage.first_index();
        let mut current = index;
        while current >= first {
            if let Some(position) = self.storage.entry(current)?.and_then(|e| e.highest_position()) {
                return Ok(position);
            }
            current -= 1;
        }
        Ok(self.storage.boundary().position)
    }

    fn last_log_id(&mut self) -> Option<(u64, u64)> {
        let last_index = self.storage.last_index();
        match self.storage.term(last_index) {
            Ok(Some(term)) => Some((last_index, term)),
            Ok(None) => Some((last_index, 0)),
            Err(e) => {
                self.fail(e);
                None
            }
        }
    }

    fn peers(&self) -> Vec<NodeId> {
        self.configuration
            .voters
            .iter()
            .copied()
            .filter(|id| *id != self.cfg.id)
            .collect()
    }

    fn send(&mut self, to: NodeId, msg: RaftMessage) {
        self.msgs.push((to, msg));
    }

    fn reset_election_timer(&mut self) {
        self.election_elapsed = 0;
        let min = self.cfg.election_tick.max(1);
        self.randomized_election_timeout = self.rng.gen_range(min..2 * min);
    }

    fn persist_hard_state(&mut self) -> bool {
        let hs = HardState {
            term: self.term,
            vote: self.vote,
            commit: self.commit,
        };
        match self.storage.save_hard_state(hs) {
            Ok(()) => true,
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    /// A local persistence failure: step down and refuse all further work.
    fn fail(&mut self, e: StorageError) {
        self.fail_consistency(format!("log storage failure: {}", e));
    }

    fn fail_consistency(&mut self, reason: String) {
        crit!(self.logger, "Replica failed"; "reason" => &reason);
        self.fatal = Some(reason);
        self.role = Role::Follower;
        self.leader_id = None;
        self.progress.clear();
        self.votes.clear();
        self.transfer = None;
        self.msgs.clear();
    }
}
