//! # Collision Arbitration
//!
//! A collision is two committed events competing for one slot of a stream,
//! typically a local commit and a replicated event carrying the same
//! sequence. The [`CollisionArbitor`] decides what to do with them; the
//! stream applies the decision.
//!
//! ## State Machine
//!
//! ```text
//!   arbitrate()
//!       │
//!       ▼
//!   DETECTED ──mediators agree──► RESOLVED(r)
//!       │
//!       └──no consensus──► PENDING_MANUAL ──resolve(id, r)──► RESOLVED(r)
//!                                │
//!                                └──add_mediator() re-offers──► RESOLVED(r) | PENDING_MANUAL
//! ```
//!
//! ## Consensus
//!
//! Each applicable mediator may recommend a resolution. A recommendation wins
//! only if every *other* applicable mediator accepts it. The first
//! recommendation that passes is used; no passing recommendation means the
//! collision waits for a human.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::types::{AppendedEventMessage, StreamName};

// =============================================================================
// Types
// =============================================================================

/// Arbitor-assigned collision id, unique per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CollisionId(pub u64);

impl fmt::Display for CollisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Two events competing for one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCollision {
    /// Stream the events belong to.
    pub stream: StreamName,
    /// The event already committed at the slot.
    pub first: Arc<AppendedEventMessage>,
    /// The incoming event.
    pub second: Arc<AppendedEventMessage>,
}

impl EventCollision {
    /// Creates a collision record.
    pub fn new(stream: StreamName, first: Arc<AppendedEventMessage>, second: Arc<AppendedEventMessage>) -> Self {
        Self { stream, first, second }
    }
}

/// Outcome of arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollisionResolution {
    /// Keep the first, drop the second.
    FirstOnly,
    /// Replace the first with the second.
    SecondOnly,
    /// Keep the first and append the second after it.
    FirstThenSecond,
    /// Replace the first with the second, then re-append the first.
    SecondThenFirst,
    /// Keep both; the second gets a fresh sequence.
    BothNoSequence,
    /// The mediator has no opinion.
    Abstain,
    /// Needs a human decision.
    Manual,
}

impl CollisionResolution {
    /// True for resolutions that settle a collision.
    pub fn is_concrete(self) -> bool {
        !matches!(self, CollisionResolution::Abstain | CollisionResolution::Manual)
    }
}

impl fmt::Display for CollisionResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CollisionResolution::FirstOnly => "FIRST_ONLY",
            CollisionResolution::SecondOnly => "SECOND_ONLY",
            CollisionResolution::FirstThenSecond => "FIRST_THEN_SECOND",
            CollisionResolution::SecondThenFirst => "SECOND_THEN_FIRST",
            CollisionResolution::BothNoSequence => "BOTH_NO_SEQUENCE",
            CollisionResolution::Abstain => "ABSTAIN",
            CollisionResolution::Manual => "MANUAL",
        };
        f.write_str(name)
    }
}

/// Where a collision stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionState {
    /// Being offered to the mediators.
    Detected,
    /// Waiting for `resolve()` or a new mediator.
    PendingManual,
    /// Settled. Terminal.
    Resolved(CollisionResolution),
}

/// A collision and its state.
#[derive(Debug, Clone)]
pub struct CollisionRecord {
    /// Arbitor-assigned id.
    pub id: CollisionId,
    /// The competing events.
    pub collision: EventCollision,
    /// Where the collision stands.
    pub state: CollisionState,
}

// =============================================================================
// Mediators
// =============================================================================

type Filter = Box<dyn Fn(&EventCollision) -> bool + Send + Sync>;
type Recommend = Box<dyn Fn(&EventCollision) -> CollisionResolution + Send + Sync>;
type Acceptance = Box<dyn Fn(&EventCollision, CollisionResolution) -> bool + Send + Sync>;

/// A pluggable collision policy.
///
/// # Example
///
/// ```rust,ignore
/// let keep_local = Mediator::new("keep-local", |_| CollisionResolution::FirstOnly)
///     .with_filter(|c| c.stream.as_str() == "orders");
/// channel.arbitor().add_mediator(keep_local);
/// ```
pub struct Mediator {
    name: String,
    filter: Option<Filter>,
    recommend: Recommend,
    acceptance: Option<Acceptance>,
}

impl Mediator {
    /// A mediator that recommends with `recommend` and accepts anything.
    pub fn new<F>(name: impl Into<String>, recommend: F) -> Self
    where
        F: Fn(&EventCollision) -> CollisionResolution + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            filter: None,
            recommend: Box::new(recommend),
            acceptance: None,
        }
    }

    /// A mediator that never recommends, only vetoes.
    pub fn veto<A>(name: impl Into<String>, acceptance: A) -> Self
    where
        A: Fn(&EventCollision, CollisionResolution) -> bool + Send + Sync + 'static,
    {
        Self::new(name, |_| CollisionResolution::Abstain).with_acceptance(acceptance)
    }

    /// Limits the mediator to collisions the predicate accepts.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&EventCollision) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Sets the acceptance check applied to other mediators' recommendations.
    pub fn with_acceptance<A>(mut self, acceptance: A) -> Self
    where
        A: Fn(&EventCollision, CollisionResolution) -> bool + Send + Sync + 'static,
    {
        self.acceptance = Some(Box::new(acceptance));
        self
    }

    /// The mediator's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn applies(&self, collision: &EventCollision) -> bool {
        self.filter.as_ref().map_or(true, |f| f(collision))
    }

    fn recommend(&self, collision: &EventCollision) -> CollisionResolution {
        (self.recommend)(collision)
    }

    fn is_acceptable(&self, collision: &EventCollision, resolution: CollisionResolution) -> bool {
        self.acceptance.as_ref().map_or(true, |a| a(collision, resolution))
    }
}

impl fmt::Debug for Mediator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mediator").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Runs consensus over `mediators`. `Manual` when nothing passes.
fn mediate(mediators: &[Arc<Mediator>], collision: &EventCollision) -> CollisionResolution {
    let applicable: Vec<&Arc<Mediator>> = mediators.iter().filter(|m| m.applies(collision)).collect();

    for (i, mediator) in applicable.iter().enumerate() {
        let recommendation = mediator.recommend(collision);
        if !recommendation.is_concrete() {
            continue;
        }
        let agreed = applicable
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .all(|(_, other)| other.is_acceptable(collision, recommendation));
        if agreed {
            return recommendation;
        }
    }
    CollisionResolution::Manual
}

// =============================================================================
// Arbitor
// =============================================================================

/// Called with each collision once it resolves.
pub type ResolutionListener = Arc<dyn Fn(CollisionId, &EventCollision, CollisionResolution) + Send + Sync>;

#[derive(Default)]
struct ArbitorState {
    next_id: u64,
    records: BTreeMap<CollisionId, CollisionRecord>,
}

/// Owns a channel's mediators and collision bookkeeping.
#[derive(Default)]
pub struct CollisionArbitor {
    mediators: RwLock<Vec<Arc<Mediator>>>,
    /// Bumped on every `add_mediator`.
    generation: AtomicU64,
    state: Mutex<ArbitorState>,
    listener: RwLock<Option<ResolutionListener>>,
}

impl CollisionArbitor {
    /// An arbitor with no mediators: every collision goes to manual.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ArbitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mediators(&self) -> Vec<Arc<Mediator>> {
        self.mediators.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Sets the callback that applies resolutions.
    pub fn set_resolution_listener(&self, listener: ResolutionListener) {
        *self.listener.write().unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    /// Offers a collision to the mediators.
    ///
    /// Never fails: lack of consensus yields `Manual` and leaves the collision
    /// pending.
    pub fn arbitrate(&self, collision: EventCollision) -> (CollisionId, CollisionResolution) {
        let id = {
            let mut state = self.state();
            state.next_id += 1;
            let id = CollisionId(state.next_id);
            state.records.insert(
                id,
                CollisionRecord {
                    id,
                    collision: collision.clone(),
                    state: CollisionState::Detected,
                },
            );
            id
        };

        loop {
            let generation = self.generation.load(Ordering::SeqCst);
            let resolution = mediate(&self.mediators(), &collision);
            if resolution.is_concrete() {
                self.settle(id, &collision, resolution);
                return (id, self.outcome(id, resolution));
            }

            let settled = {
                let mut state = self.state();
                match state.records.get_mut(&id) {
                    Some(record) if !matches!(record.state, CollisionState::Resolved(_)) => {
                        record.state = CollisionState::PendingManual;
                        false
                    }
                    _ => true,
                }
            };
            // A mediator added before the record went pending never saw it.
            if !settled && self.generation.load(Ordering::SeqCst) != generation {
                continue;
            }
            if !settled {
                warn!(
                    stream = %collision.stream,
                    collision = %id,
                    sequence = %collision.first.sequence,
                    "no mediator consensus, collision pending manual resolution"
                );
            }
            return (id, self.outcome(id, resolution));
        }
    }

    /// The settled resolution if another caller got there first.
    fn outcome(&self, id: CollisionId, fallback: CollisionResolution) -> CollisionResolution {
        match self.state_of(id) {
            Some(CollisionState::Resolved(resolution)) => resolution,
            _ => fallback,
        }
    }

    /// Records a resolution and notifies the listener outside the lock.
    /// A collision settles at most once, even under concurrent re-offers.
    fn settle(&self, id: CollisionId, collision: &EventCollision, resolution: CollisionResolution) {
        let claimed = match self.state().records.get_mut(&id) {
            Some(record) if !matches!(record.state, CollisionState::Resolved(_)) => {
                record.state = CollisionState::Resolved(resolution);
                true
            }
            _ => false,
        };
        if !claimed {
            return;
        }
        info!(stream = %collision.stream, collision = %id, resolution = %resolution, "collision resolved");

        let listener = self.listener.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(listener) = listener {
            listener(id, collision, resolution);
        }
    }

    /// Collisions still waiting for a decision.
    pub fn collisions(&self) -> Vec<CollisionRecord> {
        self.state()
            .records
            .values()
            .filter(|r| r.state == CollisionState::PendingManual)
            .cloned()
            .collect()
    }

    /// Every collision seen, in detection order.
    pub fn history(&self) -> Vec<CollisionRecord> {
        self.state().records.values().cloned().collect()
    }

    /// State of one collision.
    pub fn state_of(&self, id: CollisionId) -> Option<CollisionState> {
        self.state().records.get(&id).map(|r| r.state)
    }

    /// Manually resolves a pending collision.
    ///
    /// `Abstain` and `Manual` leave the collision pending.
    ///
    /// # Errors
    ///
    /// `Error::UnknownCollision` if `id` is not pending.
    pub fn resolve(&self, id: CollisionId, resolution: CollisionResolution) -> Result<()> {
        let collision = {
            let state = self.state();
            match state.records.get(&id) {
                Some(r) if r.state == CollisionState::PendingManual => r.collision.clone(),
                _ => return Err(Error::UnknownCollision(id.0)),
            }
        };
        if resolution.is_concrete() {
            self.settle(id, &collision, resolution);
        }
        Ok(())
    }

    /// Adds a mediator and re-offers every pending collision.
    pub fn add_mediator(&self, mediator: Mediator) {
        info!(mediator = %mediator.name(), "mediator added");
        self.mediators
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(mediator));
        self.generation.fetch_add(1, Ordering::SeqCst);

        let mediators = self.mediators();
        for record in self.collisions() {
            let resolution = mediate(&mediators, &record.collision);
            if resolution.is_concrete() {
                self.settle(record.id, &record.collision, resolution);
            }
        }
    }

    /// Removes mediators by name. Returns how many were removed.
    pub fn remove_mediator(&self, name: &str) -> usize {
        let mut mediators = self.mediators.write().unwrap_or_else(|e| e.into_inner());
        let before = mediators.len();
        mediators.retain(|m| m.name() != name);
        before - mediators.len()
    }
}

impl fmt::Debug for CollisionArbitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollisionArbitor")
            .field("mediators", &self.mediators().len())
            .field("pending", &self.collisions().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
