//! IP admission control: rate limiting and quarantine for inbound peers.
//!
//! Every remote IP the server sees lives in at most one of two lists:
//! - **watchlist**: seen recently, allowed one connection per `min_interval`
//! - **blacklist**: refused until its cooldown expires (or forever)
//!
//! A separate greylist counts per-reason warnings raised through
//! [`IpMarshall::quarantine`] so that occasional misbehaviour is tolerated
//! while a burst of it is not. Whitelisted addresses and networks bypass
//! everything and are never quarantined.

use ipnet::IpNet;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::network::connector::canonical;

/// Weight retained per second once a warning is older than its observation window.
const GRACE_DECAY_BASE: f64 = 0.95;
/// Greylist entries lighter than this are dropped by the sweep.
const GREYLIST_PRUNE_WEIGHT: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct AdmissionSettings {
    /// Minimum time between two clearances of the same IP.
    pub min_interval: Duration,
    /// Rejections tolerated before a rate-limit strike is counted.
    pub grace_strikes: u32,
    pub rate_limit_strikes: u32,
    pub rate_limit_penalty: Duration,
    /// Blacklistings after which the ban becomes permanent.
    pub blacklist_strikes: u32,
    /// Refused attempts during one ban after which it becomes permanent.
    pub connection_refusal_strikes: u32,
    pub cleanup_period: Duration,
    /// How long an idle watchlist entry is kept after its expiry.
    pub forget_after: Duration,
    /// Ban length for `quarantine` calls that don't specify one.
    pub quarantine_duration: Duration,
}

impl AdmissionSettings {
    /// Profile used for inbound peer connections.
    pub fn general() -> Self {
        Self {
            min_interval: Duration::from_secs(10),
            grace_strikes: 0,
            rate_limit_strikes: 5,
            rate_limit_penalty: Duration::from_secs(5 * 60),
            blacklist_strikes: 5,
            connection_refusal_strikes: 100,
            cleanup_period: Duration::from_secs(20),
            forget_after: Duration::from_secs(24 * 3600),
            quarantine_duration: Duration::from_secs(3600),
        }
    }

    /// Profile for validation traffic: no grace and week-long bans.
    pub fn strict() -> Self {
        Self {
            grace_strikes: 0,
            rate_limit_strikes: 3,
            rate_limit_penalty: Duration::from_secs(7 * 24 * 3600),
            blacklist_strikes: 2,
            connection_refusal_strikes: 20,
            quarantine_duration: Duration::from_secs(7 * 24 * 3600),
            ..Self::general()
        }
    }
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self::general()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    At(Instant),
    Never,
}

impl Expiry {
    /// `now + duration`, or `Never` when that is past the end of the clock.
    pub fn after(now: Instant, duration: Duration) -> Expiry {
        now.checked_add(duration).map_or(Expiry::Never, Expiry::At)
    }

    fn passed(&self, now: Instant) -> bool {
        match self {
            Expiry::At(at) => now >= *at,
            Expiry::Never => false,
        }
    }

    fn later(self, other: Expiry) -> Expiry {
        match (self, other) {
            (Expiry::At(a), Expiry::At(b)) => Expiry::At(a.max(b)),
            _ => Expiry::Never,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listing {
    Watchlist,
    Blacklist,
}

#[derive(Debug, Clone)]
pub struct QuarantineRecord {
    pub ip: IpAddr,
    pub expiry: Expiry,
    pub reason: String,
    pub details: Option<String>,
    pub rate_limit_strikes: u32,
    pub blacklist_strikes: u32,
    pub refusal_count: u32,
    grace_left: u32,
    last_clearance: Option<Instant>,
}

impl QuarantineRecord {
    fn first_sighting(ip: IpAddr, now: Instant, settings: &AdmissionSettings) -> Self {
        Self {
            ip,
            expiry: Expiry::after(now, settings.min_interval),
            reason: String::new(),
            details: None,
            rate_limit_strikes: 0,
            blacklist_strikes: 0,
            refusal_count: 0,
            grace_left: settings.grace_strikes,
            last_clearance: Some(now),
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.expiry == Expiry::Never
    }
}

#[derive(Debug, Clone, Copy)]
struct WarningEvent {
    weight: f64,
    last: Instant,
}

impl WarningEvent {
    fn decayed(&self, now: Instant, observation: Duration) -> f64 {
        let beyond = now.saturating_duration_since(self.last).saturating_sub(observation);
        self.weight * GRACE_DECAY_BASE.powf(beyond.as_secs_f64())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionStats {
    pub whitelisted_networks: usize,
    pub watchlist: usize,
    pub blacklist: usize,
    pub permanent_bans: usize,
    pub greylist: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub rehabilitated: usize,
    pub made_permanent: usize,
    pub forgotten: usize,
}

struct MarshallState {
    watchlist: HashMap<IpAddr, QuarantineRecord>,
    blacklist: HashMap<IpAddr, QuarantineRecord>,
    greylist: HashMap<(IpAddr, String), (WarningEvent, Duration)>,
    last_sweep: Instant,
}

pub struct IpMarshall {
    name: &'static str,
    settings: AdmissionSettings,
    /// Read-only after construction, consulted without the lock.
    whitelist: Vec<IpNet>,
    banned_networks: Vec<IpNet>,
    state: Mutex<MarshallState>,
}

impl IpMarshall {
    pub fn new(name: &'static str, settings: AdmissionSettings) -> Self {
        Self::with_access_rules(name, settings, Vec::new(), Vec::new())
    }

    /// Build with seeded whitelist and permanently banned networks.
    pub fn with_access_rules(
        name: &'static str,
        settings: AdmissionSettings,
        whitelist: Vec<IpNet>,
        banned_networks: Vec<IpNet>,
    ) -> Self {
        if !whitelist.is_empty() || !banned_networks.is_empty() {
            info!(
                "🛡️  [{}] Admission seeded with {} whitelisted and {} banned networks",
                name,
                whitelist.len(),
                banned_networks.len()
            );
        }
        Self {
            name,
            settings,
            whitelist,
            banned_networks,
            state: Mutex::new(MarshallState {
                watchlist: HashMap::new(),
                blacklist: HashMap::new(),
                greylist: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn settings(&self) -> &AdmissionSettings {
        &self.settings
    }

    pub fn is_whitelisted(&self, ip: IpAddr) -> bool {
        let ip = canonical(ip);
        self.whitelist.iter().any(|net| net.contains(&ip))
    }

    fn in_banned_network(&self, ip: IpAddr) -> bool {
        self.banned_networks.iter().any(|net| net.contains(&ip))
    }

    /// Decide whether a new connection from `ip` may proceed.
    pub fn request_clearance(&self, ip: IpAddr) -> bool {
        let ip = canonical(ip);
        if self.is_whitelisted(ip) {
            return true;
        }
        if self.in_banned_network(ip) {
            debug!("🚫 [{}] {} is in a banned network", self.name, ip);
            return false;
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        self.maybe_sweep(&mut state, now);

        if let Some(record) = state.blacklist.get_mut(&ip) {
            record.refusal_count = record.refusal_count.saturating_add(1);
            debug!(
                "🚫 [{}] Refused {} ({}, refusal #{})",
                self.name, ip, record.reason, record.refusal_count
            );
            return false;
        }

        let settings = &self.settings;
        let Some(record) = state.watchlist.get_mut(&ip) else {
            state
                .watchlist
                .insert(ip, QuarantineRecord::first_sighting(ip, now, settings));
            return true;
        };

        let due = record
            .last_clearance
            .map_or(true, |last| now.saturating_duration_since(last) >= settings.min_interval);
        if due {
            record.last_clearance = Some(now);
            record.rate_limit_strikes = 0;
            record.grace_left = settings.grace_strikes;
            record.expiry = Expiry::after(now, settings.min_interval);
            return true;
        }

        if record.grace_left > 0 {
            record.grace_left -= 1;
            debug!(
                "⏳ [{}] {} reconnecting too fast ({} grace left)",
                self.name, ip, record.grace_left
            );
            return false;
        }

        record.rate_limit_strikes += 1;
        debug!(
            "⚠️  [{}] Rate-limit strike #{} for {}",
            self.name, record.rate_limit_strikes, ip
        );
        if record.rate_limit_strikes < settings.rate_limit_strikes {
            return false;
        }

        if let Some(mut record) = state.watchlist.remove(&ip) {
            record.reason = "connection rate limit".to_string();
            record.details = None;
            self.ban(&mut record, Expiry::after(now, settings.rate_limit_penalty));
            state.blacklist.insert(ip, record);
        }
        false
    }

    /// Apply a ban to a record that is about to enter the blacklist.
    fn ban(&self, record: &mut QuarantineRecord, expiry: Expiry) {
        record.blacklist_strikes += 1;
        record.refusal_count = 0;
        record.expiry = if record.blacklist_strikes >= self.settings.blacklist_strikes {
            Expiry::Never
        } else {
            expiry
        };
        match record.expiry {
            Expiry::Never => warn!(
                "🚫 [{}] PERMANENTLY BANNED {} ({}, {} blacklistings)",
                self.name, record.ip, record.reason, record.blacklist_strikes
            ),
            Expiry::At(at) => warn!(
                "🚫 [{}] Blacklisted {} for {}s ({}, strike {}/{})",
                self.name,
                record.ip,
                at.saturating_duration_since(Instant::now()).as_secs(),
                record.reason,
                record.blacklist_strikes,
                self.settings.blacklist_strikes
            ),
        }
    }

    fn maybe_sweep(&self, state: &mut MarshallState, now: Instant) {
        if now.saturating_duration_since(state.last_sweep) >= self.settings.cleanup_period {
            self.sweep_locked(state, now);
        }
    }

    /// Rehabilitate expired bans and forget stale entries.
    ///
    /// Throttled to once per `cleanup_period` unless `force` is set.
    pub fn periodic_sweep(&self, force: bool) -> SweepSummary {
        let now = Instant::now();
        let mut state = self.state.lock();
        if !force
            && now.saturating_duration_since(state.last_sweep) < self.settings.cleanup_period
        {
            return SweepSummary::default();
        }
        self.sweep_locked(&mut state, now)
    }

    fn sweep_locked(&self, state: &mut MarshallState, now: Instant) -> SweepSummary {
        state.last_sweep = now;
        let mut summary = SweepSummary::default();
        let settings = &self.settings;

        let expired: Vec<IpAddr> = state
            .blacklist
            .iter()
            .filter(|(_, r)| r.expiry.passed(now))
            .map(|(ip, _)| *ip)
            .collect();

        for ip in expired {
            let Some(record) = state.blacklist.get_mut(&ip) else {
                continue;
            };
            if record.refusal_count >= settings.connection_refusal_strikes {
                record.expiry = Expiry::Never;
                summary.made_permanent += 1;
                warn!(
                    "🚫 [{}] {} kept knocking during its ban ({} refusals), now permanent",
                    self.name, ip, record.refusal_count
                );
                continue;
            }
            if let Some(mut record) = state.blacklist.remove(&ip) {
                record.rate_limit_strikes = 0;
                record.refusal_count = 0;
                record.grace_left = settings.grace_strikes;
                record.last_clearance = None;
                record.expiry = Expiry::after(now, settings.min_interval);
                info!(
                    "♻️  [{}] {} rehabilitated to watchlist after {} ban",
                    self.name, ip, record.reason
                );
                state.watchlist.insert(ip, record);
                summary.rehabilitated += 1;
            }
        }

        let before = state.watchlist.len();
        state.watchlist.retain(|_, r| match r.expiry {
            Expiry::At(at) => {
                let idle = now.saturating_duration_since(at) < settings.forget_after;
                idle || r.blacklist_strikes > 0 || r.rate_limit_strikes > 0
            }
            Expiry::Never => true,
        });
        summary.forgotten = before - state.watchlist.len();

        state
            .greylist
            .retain(|_, (event, observation)| event.decayed(now, *observation) >= GREYLIST_PRUNE_WEIGHT);

        if summary != SweepSummary::default() {
            debug!(
                "🧹 [{}] Admission sweep: {} rehabilitated, {} permanent, {} forgotten",
                self.name, summary.rehabilitated, summary.made_permanent, summary.forgotten
            );
        }
        summary
    }

    /// Administrative ban for misbehaviour detected above the transport.
    ///
    /// Same-`reason` events accumulate with a weight that decays once they
    /// are older than `grace_observation_period`; the IP is blacklisted when
    /// the weight exceeds `grace_strikes`. Returns true if a ban was applied.
    pub fn quarantine(
        &self,
        ip: IpAddr,
        reason: &str,
        duration: Option<Duration>,
        details: Option<&str>,
        grace_strikes: u32,
        grace_observation_period: Duration,
    ) -> bool {
        let ip = canonical(ip);
        if self.is_whitelisted(ip) {
            info!(
                "🛡️  [{}] Ignoring quarantine of whitelisted {} ({})",
                self.name, ip, reason
            );
            return false;
        }

        let now = Instant::now();
        let mut state = self.state.lock();

        let key = (ip, reason.to_string());
        let weight = match state.greylist.get(&key) {
            Some((event, _)) => event.decayed(now, grace_observation_period) + 1.0,
            None => 1.0,
        };
        if weight <= grace_strikes as f64 {
            state.greylist.insert(
                key,
                (WarningEvent { weight, last: now }, grace_observation_period),
            );
            debug!(
                "⚠️  [{}] Warning for {} ({}): weight {:.2}/{}",
                self.name, ip, reason, weight, grace_strikes
            );
            return false;
        }
        state.greylist.remove(&key);

        let expiry = Expiry::after(now, duration.unwrap_or(self.settings.quarantine_duration));
        if let Some(record) = state.blacklist.get_mut(&ip) {
            record.expiry = record.expiry.later(expiry);
            record.reason = reason.to_string();
            record.details = details.map(str::to_string);
            return true;
        }

        let mut record = state
            .watchlist
            .remove(&ip)
            .unwrap_or_else(|| QuarantineRecord::first_sighting(ip, now, &self.settings));
        record.reason = reason.to_string();
        record.details = details.map(str::to_string);
        self.ban(&mut record, expiry);
        state.blacklist.insert(ip, record);
        true
    }

    /// Refuse `ip` for a short fixed period without counting a blacklisting.
    ///
    /// Used for local trouble such as a socket that could not be set up,
    /// which says nothing about the peer's behaviour.
    pub fn cooldown(
        &self,
        ip: IpAddr,
        reason: &str,
        duration: Duration,
        details: Option<&str>,
    ) -> bool {
        let ip = canonical(ip);
        if self.is_whitelisted(ip) {
            return false;
        }

        let now = Instant::now();
        let expiry = Expiry::after(now, duration);
        let mut state = self.state.lock();
        if let Some(record) = state.blacklist.get_mut(&ip) {
            record.expiry = record.expiry.later(expiry);
            return true;
        }

        let mut record = state
            .watchlist
            .remove(&ip)
            .unwrap_or_else(|| QuarantineRecord::first_sighting(ip, now, &self.settings));
        record.reason = reason.to_string();
        record.details = details.map(str::to_string);
        record.refusal_count = 0;
        record.expiry = expiry;
        debug!(
            "⏸️  [{}] Cooling down {} for {}s ({})",
            self.name,
            ip,
            duration.as_secs(),
            reason
        );
        state.blacklist.insert(ip, record);
        true
    }

    pub fn is_blacklisted(&self, ip: IpAddr) -> bool {
        let ip = canonical(ip);
        self.in_banned_network(ip) || self.state.lock().blacklist.contains_key(&ip)
    }

    /// Lift any ban and warning history for `ip`. Returns true if it was banned.
    pub fn release(&self, ip: IpAddr) -> bool {
        let ip = canonical(ip);
        let mut state = self.state.lock();
        state.greylist.retain(|(grey_ip, _), _| *grey_ip != ip);
        state.watchlist.remove(&ip);
        let released = state.blacklist.remove(&ip).is_some();
        if released {
            info!("🔓 [{}] Released {} from the blacklist", self.name, ip);
        }
        released
    }

    /// Snapshot of what is known about `ip`.
    pub fn inspect(&self, ip: IpAddr) -> Option<(Listing, QuarantineRecord)> {
        let ip = canonical(ip);
        let state = self.state.lock();
        if let Some(record) = state.blacklist.get(&ip) {
            return Some((Listing::Blacklist, record.clone()));
        }
        state
            .watchlist
            .get(&ip)
            .map(|record| (Listing::Watchlist, record.clone()))
    }

    pub fn stats(&self) -> AdmissionStats {
        let state = self.state.lock();
        AdmissionStats {
            whitelisted_networks: self.whitelist.len(),
            watchlist: state.watchlist.len(),
            blacklist: state.blacklist.len(),
            permanent_bans: state.blacklist.values().filter(|r| r.is_permanent()).count(),
            greylist: state.greylist.len(),
        }
    }
}
