//! Change group registry
//!
//! Owns every group, its member list and its snapshot, and runs polls.
//!
//! ## Concurrency
//!
//! - The group map is a `DashMap`; lookups clone the group's `Arc` and
//!   release the shard before any await.
//! - A poll holds the group's snapshot mutex for its whole duration, so a
//!   group never has two polls in flight. Scheduled polls use
//!   [`ChangeGroupRegistry::poll_if_idle`] and skip instead of queueing.
//! - Member mutations that touch the snapshot (`remove_controls`, `clear`)
//!   wait for an in-flight poll to finish.
//! - `destroy` flags the group before unmapping it. A poll that returns
//!   from the gateway after that drops its results.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use qsys_core::{Clock, CommandGateway, ControlAddress, control_exists, read_controls};
use qsys_logging::{PollCorrelation, fields};
use tracing::{Instrument, debug, info, warn};

use crate::cache::{EventCache, EventRecord};
use crate::config::ChangeGroupConfig;
use crate::detector::{ChangeDetector, Snapshot};
use crate::error::{ChangeGroupError, ChangeGroupResult};
use crate::group::ChangeGroup;
use crate::types::{
    AddControlsOutcome, ClearOutcome, ControlError, CreateOutcome, GroupSummary, InvalidControl,
    PollOutcome, RemoveControlsOutcome,
};

/// Registry of change groups
pub struct ChangeGroupRegistry {
    groups: DashMap<String, Arc<ChangeGroup>>,
    gateway: Arc<dyn CommandGateway>,
    cache: Arc<EventCache>,
    clock: Arc<dyn Clock>,
    config: ChangeGroupConfig,
}

impl ChangeGroupRegistry {
    pub fn new(
        gateway: Arc<dyn CommandGateway>,
        cache: Arc<EventCache>,
        clock: Arc<dyn Clock>,
        config: ChangeGroupConfig,
    ) -> Self {
        Self {
            groups: DashMap::new(),
            gateway,
            cache,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &ChangeGroupConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<EventCache> {
        &self.cache
    }

    pub fn get(&self, group_id: &str) -> Option<Arc<ChangeGroup>> {
        self.groups.get(group_id).map(|g| Arc::clone(&g))
    }

    pub fn contains(&self, group_id: &str) -> bool {
        self.groups.contains_key(group_id)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn group(&self, group_id: &str) -> ChangeGroupResult<Arc<ChangeGroup>> {
        self.get(group_id)
            .ok_or_else(|| ChangeGroupError::not_found(group_id))
    }

    fn validate_group_id(&self, group_id: &str) -> ChangeGroupResult<()> {
        if group_id.trim().is_empty() {
            return Err(ChangeGroupError::invalid_group_id(group_id, "must not be empty"));
        }
        if group_id.trim() != group_id {
            return Err(ChangeGroupError::invalid_group_id(
                group_id,
                "must not start or end with whitespace",
            ));
        }
        if group_id.chars().any(char::is_control) {
            return Err(ChangeGroupError::invalid_group_id(
                group_id,
                "must not contain control characters",
            ));
        }
        let len = group_id.chars().count();
        if len > self.config.max_group_id_len {
            return Err(ChangeGroupError::invalid_group_id(
                group_id,
                format!(
                    "{} characters exceeds the maximum of {}",
                    len, self.config.max_group_id_len
                ),
            ));
        }
        Ok(())
    }

    /// Create a group, or report that it already exists
    ///
    /// Creating an existing group succeeds with a warning and leaves its
    /// members and snapshot untouched.
    pub fn create(&self, group_id: &str) -> ChangeGroupResult<CreateOutcome> {
        self.validate_group_id(group_id)?;

        let mut created = false;
        self.groups.entry(group_id.to_string()).or_insert_with(|| {
            created = true;
            Arc::new(ChangeGroup::new(group_id))
        });

        if created {
            info!(group_id, "Created change group");
            Ok(CreateOutcome {
                group_id: group_id.to_string(),
                created: true,
                warning: None,
            })
        } else {
            debug!(group_id, "Change group already exists");
            Ok(CreateOutcome {
                group_id: group_id.to_string(),
                created: false,
                warning: Some(format!(
                    "Change group '{}' already exists; existing state kept",
                    group_id
                )),
            })
        }
    }

    /// Add members, partitioning out invalid and already-present names
    pub async fn add_controls(
        &self,
        group_id: &str,
        names: &[String],
    ) -> ChangeGroupResult<AddControlsOutcome> {
        let group = self.group(group_id)?;

        let mut invalid_controls = Vec::new();
        let mut skipped_controls = Vec::new();
        let mut candidates: Vec<(String, ControlAddress)> = Vec::new();
        {
            let members = group.members().read();
            let mut seen = HashSet::new();
            for name in names {
                let address = match ControlAddress::parse(name) {
                    Ok(address) => address,
                    Err(e) => {
                        invalid_controls.push(InvalidControl {
                            name: name.clone(),
                            reason: e.to_string(),
                        });
                        continue;
                    }
                };
                if members.contains(name) || !seen.insert(name.as_str()) {
                    skipped_controls.push(name.clone());
                    continue;
                }
                candidates.push((name.clone(), address));
            }
        }

        if self.config.verify_controls_on_add && !candidates.is_empty() {
            let mut verified = Vec::with_capacity(candidates.len());
            for (name, address) in candidates {
                if control_exists(self.gateway.as_ref(), &address).await? {
                    verified.push((name, address));
                } else {
                    invalid_controls.push(InvalidControl {
                        name,
                        reason: "not found on core".to_string(),
                    });
                }
            }
            candidates = verified;
        }

        let (added, total_members) = {
            let mut members = group.members().write();
            let mut added = 0;
            for (name, _) in candidates {
                if members.insert(name.clone()) {
                    added += 1;
                } else {
                    skipped_controls.push(name);
                }
            }
            (added, members.len())
        };

        info!(
            group_id,
            requested = names.len(),
            added,
            invalid = invalid_controls.len(),
            skipped = skipped_controls.len(),
            "Added controls to change group"
        );

        Ok(AddControlsOutcome {
            group_id: group_id.to_string(),
            requested: names.len(),
            added,
            total_members,
            invalid_controls,
            skipped_controls,
        })
    }

    /// Remove members; absent names are reported, not rejected
    pub async fn remove_controls(
        &self,
        group_id: &str,
        names: &[String],
    ) -> ChangeGroupResult<RemoveControlsOutcome> {
        let group = self.group(group_id)?;
        let mut snapshot = group.lock_snapshot().await;

        let mut removed = 0;
        let mut not_present = Vec::new();
        let total_members = {
            let mut members = group.members().write();
            for name in names {
                if members.remove(name) {
                    snapshot.remove(name);
                    removed += 1;
                } else {
                    not_present.push(name.clone());
                }
            }
            members.len()
        };

        debug!(group_id, removed, "Removed controls from change group");
        Ok(RemoveControlsOutcome {
            group_id: group_id.to_string(),
            removed,
            not_present,
            total_members,
        })
    }

    /// Drop every member and the snapshot, keeping the group itself
    pub async fn clear(&self, group_id: &str) -> ChangeGroupResult<ClearOutcome> {
        let group = self.group(group_id)?;
        let mut snapshot = group.lock_snapshot().await;
        let removed = group.members().write().clear();
        snapshot.clear();

        debug!(group_id, removed, "Cleared change group");
        Ok(ClearOutcome {
            group_id: group_id.to_string(),
            removed,
        })
    }

    /// Unmap a group and return it
    ///
    /// Does not wait for an in-flight poll; that poll sees the destroyed
    /// flag and discards its results.
    pub fn destroy(&self, group_id: &str) -> ChangeGroupResult<Arc<ChangeGroup>> {
        let (_, group) = self
            .groups
            .remove(group_id)
            .ok_or_else(|| ChangeGroupError::not_found(group_id))?;
        group.mark_destroyed();
        info!(group_id, members = group.member_count(), "Destroyed change group");
        Ok(group)
    }

    /// Member names of a group in insertion order
    pub fn members(&self, group_id: &str) -> ChangeGroupResult<Vec<String>> {
        Ok(self.group(group_id)?.member_names())
    }

    /// Every group, ordered by id
    ///
    /// `has_auto_poll` is always false here; the scheduler owns that state.
    pub fn list(&self) -> Vec<GroupSummary> {
        let mut summaries: Vec<GroupSummary> = self
            .groups
            .iter()
            .map(|entry| {
                let group = entry.value();
                GroupSummary {
                    id: entry.key().clone(),
                    control_count: group.member_count(),
                    has_auto_poll: false,
                    poll_count: group.poll_count(),
                    last_poll_ms: group.last_poll_ms(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    fn ensure_connected(&self) -> ChangeGroupResult<()> {
        if self.gateway.is_connected() {
            Ok(())
        } else {
            Err(ChangeGroupError::Disconnected)
        }
    }

    /// Poll a group, waiting for any poll already in flight
    pub async fn poll(
        &self,
        group_id: &str,
        include_unchanged: bool,
    ) -> ChangeGroupResult<PollOutcome> {
        let group = self.group(group_id)?;
        self.ensure_connected()?;

        let ctx = PollCorrelation::manual(group_id);
        async {
            let mut snapshot = group.lock_snapshot().await;
            self.poll_locked(&group, &mut snapshot, include_unchanged)
                .await
        }
        .instrument(ctx.span())
        .await
    }

    /// Poll a group unless a poll is already in flight
    ///
    /// Returns `Ok(None)` when the group is busy.
    pub async fn poll_if_idle(
        &self,
        group_id: &str,
        ctx: &PollCorrelation,
    ) -> ChangeGroupResult<Option<PollOutcome>> {
        let group = self.group(group_id)?;
        self.ensure_connected()?;

        let Some(mut snapshot) = group.try_lock_snapshot() else {
            debug!(group_id, "Previous poll still running");
            return Ok(None);
        };
        self.poll_locked(&group, &mut snapshot, false)
            .instrument(ctx.span())
            .await
            .map(Some)
    }

    async fn poll_locked(
        &self,
        group: &ChangeGroup,
        snapshot: &mut Snapshot,
        include_unchanged: bool,
    ) -> ChangeGroupResult<PollOutcome> {
        let members = group.member_names();
        if members.is_empty() {
            group.record_poll(self.clock.now_ms());
            return Ok(PollOutcome::empty(group.id()));
        }

        let started = Instant::now();
        let read = read_controls(self.gateway.as_ref(), &members).await?;

        if group.is_destroyed() {
            debug!(
                group_id = group.id(),
                "Group destroyed during poll, dropping results"
            );
            return Err(ChangeGroupError::not_found(group.id()));
        }

        let now_ms = self.clock.now_ms();
        let changes = ChangeDetector::detect(snapshot, &read.readings, include_unchanged, now_ms);

        let records: Vec<EventRecord> = changes
            .iter()
            .filter(|c| c.changed)
            .map(|c| EventRecord::new(&c.name, c.value.clone(), now_ms).with_string(&c.string))
            .collect();
        if !records.is_empty() {
            // A destroy landing after the check above is caught under the
            // buffer lock; the batch is dropped, never moved to a new group
            self.cache
                .record_while(group.id(), records, || !group.is_destroyed());
        }
        group.record_poll(now_ms);

        let errors: Vec<ControlError> = read
            .failures
            .into_iter()
            .map(|f| ControlError {
                name: f.name,
                message: f.error.to_string(),
            })
            .collect();
        if !errors.is_empty() {
            warn!(
                group_id = group.id(),
                failed = errors.len(),
                "Some controls could not be read"
            );
        }

        let outcome = PollOutcome::new(group.id(), changes, errors);
        debug!(
            group_id = group.id(),
            { fields::CHANGE_COUNT } = outcome.change_count,
            { fields::LATENCY_MS } = started.elapsed().as_millis() as u64,
            "Polled change group"
        );
        Ok(outcome)
    }
}
