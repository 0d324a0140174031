//! Subscription registry.
//!
//! Tracks the subscriptions the server should currently be honouring and
//! replays them when the connection is re-established after a disconnect.
//! The registry is the single source of truth: an entry stays registered
//! across reconnects until the application removes it.

use std::collections::{BTreeMap, HashSet};
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::StreamError;
use crate::message::Params;
use crate::policy::RetryPolicy;
use crate::transport::Requester;

/// Named server streams accepted by `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamName {
    Ledger,
    Transactions,
    TransactionsProposed,
    Validations,
    Consensus,
    Server,
    Manifests,
    PeerStatus,
    BookChanges,
}

impl StreamName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ledger => "ledger",
            Self::Transactions => "transactions",
            Self::TransactionsProposed => "transactions_proposed",
            Self::Validations => "validations",
            Self::Consensus => "consensus",
            Self::Server => "server",
            Self::Manifests => "manifests",
            Self::PeerStatus => "peer_status",
            Self::BookChanges => "book_changes",
        }
    }
}

impl FromStr for StreamName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ledger" => Self::Ledger,
            "transactions" => Self::Transactions,
            "transactions_proposed" => Self::TransactionsProposed,
            "validations" => Self::Validations,
            "consensus" => Self::Consensus,
            "server" => Self::Server,
            "manifests" => Self::Manifests,
            "peer_status" => Self::PeerStatus,
            "book_changes" => Self::BookChanges,
            other => return Err(format!("unknown stream '{other}'")),
        })
    }
}

impl std::fmt::Display for StreamName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A currency, optionally qualified by its issuing account (XRP has none).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Issue {
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
}

impl Issue {
    pub fn xrp() -> Self {
        Self { currency: "XRP".into(), issuer: None }
    }

    pub fn issued(currency: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self { currency: currency.into(), issuer: Some(issuer.into()) }
    }
}

/// Parses `XRP` or `CURRENCY.ISSUER`.
impl FromStr for Issue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            None if s.eq_ignore_ascii_case("XRP") => Ok(Self::xrp()),
            None => Err(format!("'{s}' needs an issuer (CURRENCY.ISSUER)")),
            Some((currency, issuer)) if !currency.is_empty() && !issuer.is_empty() => {
                Ok(Self::issued(currency, issuer))
            }
            Some(_) => Err(format!("malformed issue '{s}'")),
        }
    }
}

impl std::fmt::Display for Issue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.issuer {
            Some(issuer) => write!(f, "{}.{}", self.currency, issuer),
            None => f.write_str(&self.currency),
        }
    }
}

/// An order book watch target.
///
/// Identity is the currency pair only; `snapshot` and `both` are request options.
#[derive(Debug, Clone)]
pub struct Book {
    pub taker_pays: Issue,
    pub taker_gets: Issue,
    /// Ask the server for the current book state when subscribing.
    pub snapshot: bool,
    /// Watch both sides of the book.
    pub both: bool,
}

impl Book {
    pub fn new(taker_pays: Issue, taker_gets: Issue) -> Self {
        Self { taker_pays, taker_gets, snapshot: false, both: false }
    }

    pub fn with_snapshot(mut self, snapshot: bool) -> Self {
        self.snapshot = snapshot;
        self
    }

    pub fn with_both(mut self, both: bool) -> Self {
        self.both = both;
        self
    }

    fn to_wire(&self, unsubscribe: bool) -> Value {
        let mut book = json!({
            "taker_pays": self.taker_pays,
            "taker_gets": self.taker_gets,
        });
        if self.snapshot && !unsubscribe {
            book["snapshot"] = Value::Bool(true);
        }
        if self.both {
            book["both"] = Value::Bool(true);
        }
        book
    }
}

impl PartialEq for Book {
    fn eq(&self, other: &Self) -> bool {
        self.taker_pays == other.taker_pays && self.taker_gets == other.taker_gets
    }
}

impl Eq for Book {}

impl Hash for Book {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.taker_pays.hash(state);
        self.taker_gets.hash(state);
    }
}

/// The three wire-level subscription families. One replay request is sent per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubscriptionKind {
    Streams,
    Accounts,
    Books,
}

/// A named watch target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subscription {
    Stream(StreamName),
    Account(String),
    OrderBook(Book),
}

impl Subscription {
    pub fn stream(name: StreamName) -> Self {
        Self::Stream(name)
    }

    pub fn account(address: impl Into<String>) -> Self {
        Self::Account(address.into())
    }

    pub fn book(book: Book) -> Self {
        Self::OrderBook(book)
    }

    pub fn kind(&self) -> SubscriptionKind {
        match self {
            Self::Stream(_) => SubscriptionKind::Streams,
            Self::Account(_) => SubscriptionKind::Accounts,
            Self::OrderBook(_) => SubscriptionKind::Books,
        }
    }
}

impl std::fmt::Display for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream(name) => write!(f, "stream:{name}"),
            Self::Account(address) => write!(f, "account:{address}"),
            Self::OrderBook(book) => write!(f, "book:{}/{}", book.taker_pays, book.taker_gets),
        }
    }
}

/// Build `subscribe` / `unsubscribe` params for a set of subscriptions.
///
/// Keys of the same kind are batched into one array.
pub fn command_params(subs: &[Subscription], unsubscribe: bool) -> Params {
    let mut streams = Vec::new();
    let mut accounts = Vec::new();
    let mut books = Vec::new();
    for sub in subs {
        match sub {
            Subscription::Stream(name) => streams.push(Value::String(name.as_str().into())),
            Subscription::Account(address) => accounts.push(Value::String(address.clone())),
            Subscription::OrderBook(book) => books.push(book.to_wire(unsubscribe)),
        }
    }

    let mut params = Params::new();
    if !streams.is_empty() {
        params.insert("streams".into(), Value::Array(streams));
    }
    if !accounts.is_empty() {
        params.insert("accounts".into(), Value::Array(accounts));
    }
    if !books.is_empty() {
        params.insert("books".into(), Value::Array(books));
    }
    params
}

/// What the caller of [`SubscriptionRegistry::add`] must do on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Already registered; nothing to send.
    AlreadyPresent,
    /// Recorded; the next replay will send it.
    Deferred,
    /// Recorded and the connection is live; send `subscribe` now.
    SendNow,
}

/// What the caller of [`SubscriptionRegistry::remove`] must do on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Absent,
    /// Removed; the server was not honouring it, nothing to send.
    Forgotten,
    /// Removed while its `subscribe` is in flight; whoever sent that
    /// `subscribe` retracts it once acknowledged.
    Retracted,
    /// Removed; send `unsubscribe` now.
    SendNow,
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default)]
pub struct ReplayReport {
    pub restored: Vec<Subscription>,
    pub failed: Vec<(Subscription, String)>,
}

impl ReplayReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

struct Entry {
    sub: Subscription,
    /// The server has acknowledged this subscription on the current session.
    synced: bool,
}

#[derive(Default)]
struct RegistryState {
    entries: Vec<Entry>,
    /// A session is up and replay has finished; new adds go straight to the wire.
    live: bool,
    /// Subscriptions whose `subscribe` was sent on this session and not yet answered.
    in_flight: HashSet<Subscription>,
    /// In-flight subscriptions removed before their answer arrived.
    retracted: HashSet<Subscription>,
}

/// Manages active subscriptions and supports replay after reconnect.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a subscription. Idempotent.
    pub fn add(&self, sub: Subscription) -> Registration {
        let mut state = self.lock();
        if state.entries.iter().any(|e| e.sub == sub) {
            return Registration::AlreadyPresent;
        }
        // Re-added before the retracted subscribe was answered: that answer covers it.
        let covered = state.retracted.remove(&sub);
        state.entries.push(Entry { sub: sub.clone(), synced: false });
        if covered || !state.live {
            Registration::Deferred
        } else {
            state.in_flight.insert(sub);
            Registration::SendNow
        }
    }

    /// Remove a subscription. Idempotent.
    pub fn remove(&self, sub: &Subscription) -> Removal {
        let mut state = self.lock();
        let Some(pos) = state.entries.iter().position(|e| &e.sub == sub) else {
            return Removal::Absent;
        };
        let entry = state.entries.remove(pos);
        if state.in_flight.contains(sub) {
            state.retracted.insert(entry.sub);
            Removal::Retracted
        } else if entry.synced && state.live {
            Removal::SendNow
        } else {
            Removal::Forgotten
        }
    }

    /// Put back an entry whose `unsubscribe` the server refused.
    pub fn reinstate(&self, sub: Subscription) {
        let mut state = self.lock();
        if state.entries.iter().any(|e| e.sub == sub) {
            return;
        }
        let synced = state.live;
        state.entries.push(Entry { sub, synced });
    }

    /// The registered subscriptions in insertion order.
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.lock().entries.iter().map(|e| e.sub.clone()).collect()
    }

    pub fn contains(&self, sub: &Subscription) -> bool {
        self.lock().entries.iter().any(|e| &e.sub == sub)
    }

    /// Number of registered subscriptions.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` while a session is up and replay has completed.
    pub fn is_live(&self) -> bool {
        self.lock().live
    }

    /// Record the answer to a `subscribe` sent for `subs` on this session.
    ///
    /// Returns the subscriptions that were removed while in flight and that
    /// the server has now accepted: the caller must `unsubscribe` them.
    /// Answers from an earlier session are ignored.
    pub fn settle(&self, subs: &[Subscription], acknowledged: bool) -> Vec<Subscription> {
        let mut state = self.lock();
        let mut retract = Vec::new();
        for sub in subs {
            if !state.in_flight.remove(sub) {
                continue;
            }
            if state.retracted.remove(sub) {
                if acknowledged {
                    retract.push(sub.clone());
                }
            } else if acknowledged {
                if let Some(entry) = state.entries.iter_mut().find(|e| &e.sub == sub) {
                    entry.synced = true;
                }
            }
        }
        retract
    }

    /// The session is gone: nothing is honoured by the server any more.
    pub fn mark_offline(&self) {
        let mut state = self.lock();
        state.live = false;
        state.in_flight.clear();
        state.retracted.clear();
        for entry in state.entries.iter_mut() {
            entry.synced = false;
        }
    }

    /// Unsynced entries not yet tried in this replay. When there are none
    /// the registry goes live in the same critical section, so an `add`
    /// either lands in a replay round or sees `live` and sends itself.
    fn next_round(&self, attempted: &HashSet<Subscription>) -> Option<Vec<Subscription>> {
        let mut state = self.lock();
        let pending: Vec<Subscription> = state
            .entries
            .iter()
            .filter(|e| !e.synced && !attempted.contains(&e.sub))
            .map(|e| e.sub.clone())
            .collect();
        if pending.is_empty() {
            state.live = true;
            None
        } else {
            state.in_flight.extend(pending.iter().cloned());
            Some(pending)
        }
    }

    /// Re-issue every registered subscription through `requester`.
    ///
    /// Sends one batched `subscribe` per kind, concurrently. A batch that
    /// fails for good is split so one bad key cannot block the others.
    /// Returns once every subscription is either restored or reported failed,
    /// at which point the registry is live.
    pub async fn replay<R>(&self, requester: &R, policy: &RetryPolicy) -> ReplayReport
    where
        R: Requester + ?Sized,
    {
        let mut attempted = HashSet::new();
        let mut report = ReplayReport::default();

        while let Some(round) = self.next_round(&attempted) {
            attempted.extend(round.iter().cloned());

            let mut groups: BTreeMap<SubscriptionKind, Vec<Subscription>> = BTreeMap::new();
            for sub in round {
                groups.entry(sub.kind()).or_default().push(sub);
            }
            debug!(kinds = groups.len(), "replaying subscriptions");

            let outcomes = join_all(
                groups
                    .into_values()
                    .map(|subs| replay_group(requester, subs, policy)),
            )
            .await;

            let mut retract = Vec::new();
            for (sub, outcome) in outcomes.into_iter().flatten() {
                let removed = self.settle(std::slice::from_ref(&sub), outcome.is_ok());
                if !removed.is_empty() {
                    retract.extend(removed);
                    continue;
                }
                if !self.contains(&sub) {
                    continue;
                }
                match outcome {
                    Ok(()) => report.restored.push(sub),
                    Err(reason) => report.failed.push((sub, reason)),
                }
            }
            if !retract.is_empty() {
                debug!(count = retract.len(), "retracting subscriptions removed during replay");
                let params = command_params(&retract, true);
                if let Err(e) = requester.command("unsubscribe", params).await {
                    warn!(error = %e, "retracting removed subscriptions failed");
                }
            }
        }

        info!(
            restored = report.restored.len(),
            failed = report.failed.len(),
            "subscription replay finished"
        );
        report
    }
}

async fn replay_group<R>(
    requester: &R,
    subs: Vec<Subscription>,
    policy: &RetryPolicy,
) -> Vec<(Subscription, Result<(), String>)>
where
    R: Requester + ?Sized,
{
    let params = command_params(&subs, false);
    match subscribe_with_retry(requester, params, policy).await {
        Ok(()) => subs.into_iter().map(|s| (s, Ok(()))).collect(),
        Err(e) if subs.len() == 1 || e.is_connection_scoped() => {
            let reason = e.to_string();
            subs.into_iter().map(|s| (s, Err(reason.clone()))).collect()
        }
        Err(e) => {
            warn!(error = %e, count = subs.len(), "batched replay rejected, retrying individually");
            join_all(subs.into_iter().map(|sub| async move {
                let params = command_params(std::slice::from_ref(&sub), false);
                let outcome = subscribe_with_retry(requester, params, policy)
                    .await
                    .map_err(|e| e.to_string());
                (sub, outcome)
            }))
            .await
        }
    }
}

async fn subscribe_with_retry<R>(
    requester: &R,
    params: Params,
    policy: &RetryPolicy,
) -> Result<(), StreamError>
where
    R: Requester + ?Sized,
{
    let mut attempt = 0u32;
    loop {
        match requester.command("subscribe", params.clone()).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_retryable() => {
                attempt += 1;
                let Some(delay) = policy.next_delay(attempt) else {
                    return Err(e);
                };
                warn!(error = %e, attempt, "subscribe failed, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RetryConfig;
    use async_trait::async_trait;
    use std::time::Duration;

    fn ledger() -> Subscription {
        Subscription::stream(StreamName::Ledger)
    }

    fn rlusd_book() -> Book {
        let rlusd = Issue::issued(
            "524C555344000000000000000000000000000000",
            "rMxCKbEDwqr76QuheSUMdEGf4B9xJ8m5De",
        );
        Book::new(Issue::xrp(), rlusd)
    }

    /// Records every subscribe; rejects those that mention `bad_account`,
    /// answers `tooBusy` for the first `busy` calls. Unsubscribes always succeed.
    #[derive(Default)]
    struct FakeRequester {
        calls: Mutex<Vec<Params>>,
        unsubscribes: Mutex<Vec<Params>>,
        busy: Mutex<u32>,
        bad_account: Option<String>,
        on_call: Option<Box<dyn Fn() + Send + Sync>>,
    }

    #[async_trait]
    impl Requester for FakeRequester {
        async fn command(&self, command: &str, params: Params) -> Result<Value, StreamError> {
            if command == "unsubscribe" {
                self.unsubscribes.lock().unwrap().push(params);
                return Ok(json!({}));
            }
            assert_eq!(command, "subscribe");
            self.calls.lock().unwrap().push(params.clone());
            if let Some(hook) = &self.on_call {
                hook();
            }
            {
                let mut busy = self.busy.lock().unwrap();
                if *busy > 0 {
                    *busy -= 1;
                    return Err(StreamError::Rpc {
                        command: command.into(),
                        error: "tooBusy".into(),
                        code: None,
                        message: None,
                    });
                }
            }
            if let (Some(bad), Some(accounts)) = (&self.bad_account, params.get("accounts")) {
                if accounts.as_array().unwrap().iter().any(|a| a == bad.as_str()) {
                    return Err(StreamError::Rpc {
                        command: command.into(),
                        error: "actMalformed".into(),
                        code: Some(35),
                        message: None,
                    });
                }
            }
            Ok(json!({}))
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries: Some(3),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            multiplier: 2.0,
            jitter_fraction: 0.0,
        })
    }

    #[test]
    fn add_and_remove_are_idempotent() {
        let reg = SubscriptionRegistry::new();
        assert_eq!(reg.add(ledger()), Registration::Deferred);
        assert_eq!(reg.add(ledger()), Registration::AlreadyPresent);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.remove(&ledger()), Removal::Forgotten);
        assert_eq!(reg.remove(&ledger()), Removal::Absent);
        assert!(reg.is_empty());
    }

    #[test]
    fn snapshot_matches_net_set() {
        let pool = [
            ledger(),
            Subscription::stream(StreamName::Validations),
            Subscription::account("rA"),
            Subscription::account("rB"),
            Subscription::book(rlusd_book()),
        ];
        let reg = SubscriptionRegistry::new();
        let mut model: HashSet<Subscription> = HashSet::new();

        // Deterministic LCG drives a long add/remove sequence.
        let mut seed: u64 = 0x2545_f491;
        for _ in 0..500 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let sub = pool[(seed >> 33) as usize % pool.len()].clone();
            if (seed >> 20) & 1 == 0 {
                reg.add(sub.clone());
                model.insert(sub);
            } else {
                reg.remove(&sub);
                model.remove(&sub);
            }
            let snap: HashSet<Subscription> = reg.snapshot().into_iter().collect();
            assert_eq!(snap, model);
            assert_eq!(reg.len(), model.len());
        }
    }

    #[test]
    fn book_identity_ignores_options() {
        let reg = SubscriptionRegistry::new();
        reg.add(Subscription::book(rlusd_book().with_snapshot(true)));
        assert_eq!(reg.add(Subscription::book(rlusd_book())), Registration::AlreadyPresent);
    }

    #[test]
    fn params_are_batched_per_kind() {
        let subs = vec![
            ledger(),
            Subscription::account("rA"),
            Subscription::stream(StreamName::Consensus),
            Subscription::account("rB"),
            Subscription::book(rlusd_book().with_snapshot(true)),
        ];
        let params = command_params(&subs, false);
        assert_eq!(params["streams"], json!(["ledger", "consensus"]));
        assert_eq!(params["accounts"], json!(["rA", "rB"]));
        assert_eq!(params["books"][0]["taker_pays"], json!({"currency": "XRP"}));
        assert_eq!(params["books"][0]["snapshot"], json!(true));

        let unsub = command_params(&subs[4..], true);
        assert!(unsub["books"][0].get("snapshot").is_none());
    }

    #[test]
    fn live_registry_sends_immediately() {
        let reg = SubscriptionRegistry::new();
        reg.add(ledger());
        assert!(reg.next_round(&HashSet::new()).is_some());
        assert!(reg.settle(&[ledger()], true).is_empty());
        assert!(reg.next_round(&HashSet::new()).is_none());
        assert!(reg.is_live());

        assert_eq!(reg.add(Subscription::account("rA")), Registration::SendNow);
        assert_eq!(reg.remove(&ledger()), Removal::SendNow);

        reg.mark_offline();
        assert!(!reg.is_live());
        assert_eq!(reg.remove(&Subscription::account("rA")), Removal::Forgotten);
    }

    #[test]
    fn removal_while_in_flight_is_retracted() {
        let reg = SubscriptionRegistry::new();
        assert!(reg.next_round(&HashSet::new()).is_none());
        let account = Subscription::account("rA");

        assert_eq!(reg.add(account.clone()), Registration::SendNow);
        assert_eq!(reg.remove(&account), Removal::Retracted);
        assert_eq!(reg.settle(&[account.clone()], true), vec![account.clone()]);
        assert!(reg.is_empty());

        // Re-added before the answer: the pending subscribe covers it.
        assert_eq!(reg.add(account.clone()), Registration::SendNow);
        assert_eq!(reg.remove(&account), Removal::Retracted);
        assert_eq!(reg.add(account.clone()), Registration::Deferred);
        assert!(reg.settle(&[account.clone()], true).is_empty());
        assert_eq!(reg.remove(&account), Removal::SendNow);

        // A rejected subscribe needs no retraction.
        assert_eq!(reg.add(account.clone()), Registration::SendNow);
        assert_eq!(reg.remove(&account), Removal::Retracted);
        assert!(reg.settle(&[account], false).is_empty());
    }

    #[test]
    fn answers_from_a_dropped_session_are_ignored() {
        let reg = SubscriptionRegistry::new();
        assert!(reg.next_round(&HashSet::new()).is_none());
        assert_eq!(reg.add(ledger()), Registration::SendNow);
        reg.mark_offline();
        assert!(reg.settle(&[ledger()], true).is_empty());
        // Still unsynced, so the next replay picks it up.
        assert_eq!(reg.next_round(&HashSet::new()), Some(vec![ledger()]));
    }

    #[test]
    fn refused_unsubscribe_is_reinstated() {
        let reg = SubscriptionRegistry::new();
        assert!(reg.next_round(&HashSet::new()).is_none());
        reg.reinstate(ledger());
        reg.reinstate(ledger());
        assert_eq!(reg.snapshot(), vec![ledger()]);
        assert_eq!(reg.remove(&ledger()), Removal::SendNow);
    }

    #[test]
    fn issue_parsing() {
        assert_eq!("xrp".parse::<Issue>().unwrap(), Issue::xrp());
        assert_eq!("USD.rIssuer".parse::<Issue>().unwrap(), Issue::issued("USD", "rIssuer"));
        assert!("USD".parse::<Issue>().is_err());
        assert!(".r".parse::<Issue>().is_err());
        assert_eq!("peer_status".parse::<StreamName>().unwrap(), StreamName::PeerStatus);
        assert!("ledgers".parse::<StreamName>().is_err());
    }

    #[tokio::test]
    async fn replay_sends_one_request_per_kind() {
        let reg = SubscriptionRegistry::new();
        reg.add(ledger());
        reg.add(Subscription::stream(StreamName::Validations));
        reg.add(Subscription::account("rA"));
        reg.add(Subscription::account("rB"));
        reg.add(Subscription::book(rlusd_book()));

        let fake = FakeRequester::default();
        let report = reg.replay(&fake, &fast_policy()).await;

        assert!(report.is_complete());
        assert_eq!(report.restored.len(), 5);
        assert_eq!(fake.calls.lock().unwrap().len(), 3);
        assert!(reg.is_live());
    }

    #[tokio::test]
    async fn rejected_batch_is_split() {
        let reg = SubscriptionRegistry::new();
        reg.add(Subscription::account("rGood"));
        reg.add(Subscription::account("rBad"));
        reg.add(ledger());

        let fake = FakeRequester { bad_account: Some("rBad".into()), ..Default::default() };
        let report = reg.replay(&fake, &fast_policy()).await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, Subscription::account("rBad"));
        assert!(report.restored.contains(&Subscription::account("rGood")));
        assert!(report.restored.contains(&ledger()));
        // streams batch + failed accounts batch + two individual retries
        assert_eq!(fake.calls.lock().unwrap().len(), 4);
        // the failure is reported but the entry stays registered
        assert!(reg.contains(&Subscription::account("rBad")));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let reg = SubscriptionRegistry::new();
        reg.add(ledger());

        let fake = FakeRequester { busy: Mutex::new(2), ..Default::default() };
        let report = reg.replay(&fake, &fast_policy()).await;

        assert!(report.is_complete());
        assert_eq!(fake.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn adds_during_replay_get_another_round() {
        let reg = SubscriptionRegistry::new();
        reg.add(ledger());

        let late = reg.clone();
        let fake = FakeRequester {
            on_call: Some(Box::new(move || {
                late.add(Subscription::account("rLate"));
            })),
            ..Default::default()
        };
        let report = reg.replay(&fake, &fast_policy()).await;

        assert_eq!(report.restored.len(), 2);
        assert_eq!(fake.calls.lock().unwrap().len(), 2);
        assert!(reg.is_live());
    }

    #[tokio::test]
    async fn removal_during_replay_is_retracted_after_ack() {
        let reg = SubscriptionRegistry::new();
        reg.add(ledger());
        reg.add(Subscription::account("rA"));

        let app = reg.clone();
        let fake = FakeRequester {
            on_call: Some(Box::new(move || {
                app.remove(&Subscription::stream(StreamName::Ledger));
            })),
            ..Default::default()
        };
        let report = reg.replay(&fake, &fast_policy()).await;

        assert_eq!(report.restored, vec![Subscription::account("rA")]);
        let unsubscribes = fake.unsubscribes.lock().unwrap().clone();
        assert_eq!(unsubscribes.len(), 1);
        assert_eq!(unsubscribes[0]["streams"], json!(["ledger"]));
        assert_eq!(reg.snapshot(), vec![Subscription::account("rA")]);
        assert!(reg.is_live());
    }
}
