//! Pick Aggregator: deduplicated P-pick store and event trigger.
//!
//! Maintains the authoritative view of recent P-phase arrivals, promotes a
//! qualifying co-pick pattern into an event, and drives the inference
//! cadence while the event is active. The core is a synchronous state
//! machine fed explicit `now` values; the async loop around it supplies
//! picks and a coarse 100 ms timer, so every transition is unit-testable
//! without wall-clock sleeps.

pub mod haversine;
pub mod queue;

pub use queue::TickQueue;

use crate::catalog::StationCatalog;
use crate::config::Config;
use crate::types::{Phase, Pick, StationPick, TickRequest};
use haversine::haversine_km;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// What the aggregator did with one pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickDisposition {
    /// Stored (possibly replacing a duplicate of lower weight).
    Accepted,
    /// Discarded as a duplicate of an equal-or-better pick.
    Deduplicated,
    /// Station absent from the catalog.
    UnknownStation,
    /// Outside the active event's linger window, or not a P pick.
    Rejected,
}

/// Result of feeding one pick through the state machine.
pub struct PickOutcome {
    pub disposition: PickDisposition,
    /// Ticks that became due while handling the pick.
    pub ticks: Vec<TickRequest>,
}

/// Aggregator health counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PickStats {
    pub picks_received: u64,
    pub picks_accepted: u64,
    pub picks_deduplicated: u64,
    pub picks_unknown_station: u64,
    pub picks_rejected: u64,
    pub events_started: u64,
    pub ticks_emitted: u64,
}

#[derive(Debug, Clone)]
struct StoredPick {
    station: String,
    pick_time: f64,
    weight: f64,
    /// Arrival wall time, used for short-horizon expiry.
    sys_time: f64,
}

/// An open event and its tick schedule.
#[derive(Debug)]
struct EventState {
    event_id: u64,
    first_pick_time: f64,
    /// First accepted pick per station.
    accepted: BTreeMap<String, StoredPick>,
    last_pick_time: f64,
    last_pick_sys_time: f64,
    /// 1-based index of the next tick to emit.
    next_tick_index: u32,
}

enum State {
    Idle,
    Active(EventState),
}

/// Deduplicating pick store with event trigger and tick scheduling.
pub struct PickAggregator {
    stations: Arc<StationCatalog>,
    epsilon_pick: f64,
    trigger_min_stations: usize,
    trigger_window: f64,
    trigger_spatial_km: f64,
    event_linger: f64,
    event_drain: f64,
    tick_interval: f64,
    initial_delay: f64,
    recent: Vec<StoredPick>,
    state: State,
    next_event_id: u64,
    stats: PickStats,
}

impl PickAggregator {
    pub fn new(cfg: &Config, stations: Arc<StationCatalog>) -> Self {
        Self {
            stations,
            epsilon_pick: cfg.epsilon_pick,
            trigger_min_stations: cfg.trigger_min_stations,
            trigger_window: cfg.trigger_window_seconds,
            trigger_spatial_km: cfg.trigger_spatial_km,
            event_linger: cfg.event_linger_seconds,
            event_drain: cfg.event_drain_seconds,
            tick_interval: cfg.tick_interval,
            initial_delay: cfg.initial_delay,
            recent: Vec::new(),
            state: State::Idle,
            next_event_id: 0,
            stats: PickStats::default(),
        }
    }

    /// Feed one pick into the state machine at wall time `now`.
    pub fn on_pick(&mut self, pick: &Pick, now: f64) -> PickOutcome {
        self.stats.picks_received += 1;

        if pick.phase != Phase::P {
            self.stats.picks_rejected += 1;
            return self.outcome(PickDisposition::Rejected, now);
        }
        if self.stations.get(&pick.station).is_none() {
            self.stats.picks_unknown_station += 1;
            debug!(station = %pick.station, "pick for station absent from catalog");
            return self.outcome(PickDisposition::UnknownStation, now);
        }

        let stored = StoredPick {
            station: pick.station.clone(),
            pick_time: pick.pick_time,
            weight: pick.weight,
            sys_time: now,
        };

        let disposition = if self.is_active() {
            self.handle_active_pick(stored, now)
        } else {
            self.handle_idle_pick(stored, now)
        };
        self.outcome(disposition, now)
    }

    /// Coarse timer callback; emits any due or terminal ticks.
    pub fn on_timer(&mut self, now: f64) -> Vec<TickRequest> {
        if matches!(self.state, State::Idle) {
            self.prune_recent(now);
        }
        self.check_ticks(now)
    }

    pub fn stats(&self) -> &PickStats {
        &self.stats
    }

    /// Whether an event is currently active.
    pub fn is_active(&self) -> bool {
        matches!(self.state, State::Active(_))
    }

    fn handle_idle_pick(&mut self, stored: StoredPick, now: f64) -> PickDisposition {
        let disposition = merge_pick(&mut self.recent, stored, self.epsilon_pick);
        if disposition == PickDisposition::Accepted {
            self.stats.picks_accepted += 1;
            self.prune_recent(now);
            self.try_trigger(now);
        } else {
            self.stats.picks_deduplicated += 1;
        }
        disposition
    }

    fn handle_active_pick(&mut self, stored: StoredPick, now: f64) -> PickDisposition {
        let State::Active(event) = &mut self.state else {
            return PickDisposition::Rejected;
        };
        let disposition =
            accept_into_event(event, stored, self.epsilon_pick, self.event_linger, now);
        match disposition {
            PickDisposition::Accepted => self.stats.picks_accepted += 1,
            PickDisposition::Deduplicated => self.stats.picks_deduplicated += 1,
            _ => self.stats.picks_rejected += 1,
        }
        disposition
    }

    fn outcome(&mut self, disposition: PickDisposition, now: f64) -> PickOutcome {
        PickOutcome {
            disposition,
            ticks: self.check_ticks(now),
        }
    }

    /// Drop short-horizon picks whose arrival aged past the trigger window.
    fn prune_recent(&mut self, now: f64) {
        let horizon = self.trigger_window;
        self.recent.retain(|p| p.sys_time + horizon >= now);
    }

    /// Look for a mutually-compatible pick set and open an event on it.
    fn try_trigger(&mut self, now: f64) {
        if self.recent.len() < self.trigger_min_stations {
            return;
        }

        let mut sorted: Vec<&StoredPick> = self.recent.iter().collect();
        sorted.sort_by(|a, b| {
            a.pick_time
                .total_cmp(&b.pick_time)
                .then_with(|| a.station.cmp(&b.station))
        });

        // Greedy clique growth from every seed: small pick counts make the
        // cubic scan negligible.
        for seed in 0..sorted.len() {
            let mut chosen: Vec<&StoredPick> = vec![sorted[seed]];
            for &candidate in sorted.iter().filter(|p| p.station != sorted[seed].station) {
                let compatible = chosen.iter().all(|member| {
                    (candidate.pick_time - member.pick_time).abs() <= self.trigger_window
                        && self.within_spatial_gate(member, candidate)
                });
                if compatible {
                    chosen.push(candidate);
                }
            }
            if chosen.len() >= self.trigger_min_stations {
                let satisfying: Vec<StoredPick> = chosen.into_iter().cloned().collect();
                self.open_event(satisfying, now);
                return;
            }
        }
    }

    fn within_spatial_gate(&self, a: &StoredPick, b: &StoredPick) -> bool {
        match (self.stations.get(&a.station), self.stations.get(&b.station)) {
            (Some(ma), Some(mb)) => {
                haversine_km(ma.latitude, ma.longitude, mb.latitude, mb.longitude)
                    <= self.trigger_spatial_km
            }
            _ => false,
        }
    }

    fn open_event(&mut self, satisfying: Vec<StoredPick>, now: f64) {
        self.next_event_id += 1;
        let first_pick_time = satisfying
            .iter()
            .map(|p| p.pick_time)
            .fold(f64::INFINITY, f64::min);
        let last_pick_time = satisfying
            .iter()
            .map(|p| p.pick_time)
            .fold(f64::NEG_INFINITY, f64::max);

        let mut event = EventState {
            event_id: self.next_event_id,
            first_pick_time,
            accepted: satisfying
                .into_iter()
                .map(|p| (p.station.clone(), p))
                .collect(),
            last_pick_time,
            last_pick_sys_time: now,
            next_tick_index: 1,
        };

        // Fold in the remaining short-horizon picks under the event rule.
        for pick in std::mem::take(&mut self.recent) {
            if event.accepted.contains_key(&pick.station) {
                continue;
            }
            accept_into_event(&mut event, pick, self.epsilon_pick, self.event_linger, now);
        }

        info!(
            event_id = event.event_id,
            first_pick_time = event.first_pick_time,
            stations = event.accepted.len(),
            "event triggered"
        );
        self.stats.events_started += 1;
        self.state = State::Active(event);
    }

    /// Emit every due tick; drain the event to a terminal tick when picks
    /// have gone quiet.
    fn check_ticks(&mut self, now: f64) -> Vec<TickRequest> {
        let State::Active(event) = &mut self.state else {
            return Vec::new();
        };
        let mut ticks = Vec::new();

        if now - event.last_pick_sys_time >= self.event_drain {
            let tick = build_tick(event, now, self.tick_interval, true);
            info!(
                event_id = event.event_id,
                ticks = tick.tick_index,
                "event drained, emitting terminal tick"
            );
            ticks.push(tick);
            self.stats.ticks_emitted += 1;
            self.state = State::Idle;
            return ticks;
        }

        loop {
            let due = event.first_pick_time
                + self.initial_delay
                + (event.next_tick_index - 1) as f64 * self.tick_interval;
            if now < due {
                break;
            }
            ticks.push(build_tick(event, now, self.tick_interval, false));
            event.next_tick_index += 1;
            self.stats.ticks_emitted += 1;
        }
        ticks
    }
}

/// Store a pick into a flat buffer under the duplicate rule: within
/// `epsilon` of the station's existing pick the higher weight survives
/// (tie: earlier pick time); farther apart the newer pick replaces.
fn merge_pick(buffer: &mut Vec<StoredPick>, pick: StoredPick, epsilon: f64) -> PickDisposition {
    if let Some(existing) = buffer.iter_mut().find(|p| p.station == pick.station) {
        let near = (existing.pick_time - pick.pick_time).abs() < epsilon;
        if near && !duplicate_wins(&pick, existing) {
            return PickDisposition::Deduplicated;
        }
        *existing = pick;
        return PickDisposition::Accepted;
    }
    buffer.push(pick);
    PickDisposition::Accepted
}

/// Whether `challenger` beats `incumbent` under the duplicate rule.
fn duplicate_wins(challenger: &StoredPick, incumbent: &StoredPick) -> bool {
    if challenger.weight != incumbent.weight {
        challenger.weight > incumbent.weight
    } else {
        challenger.pick_time < incumbent.pick_time
    }
}

fn accept_into_event(
    event: &mut EventState,
    pick: StoredPick,
    epsilon: f64,
    linger: f64,
    now: f64,
) -> PickDisposition {
    if let Some(existing) = event.accepted.get_mut(&pick.station) {
        let near = (existing.pick_time - pick.pick_time).abs() < epsilon;
        if near {
            if duplicate_wins(&pick, existing) {
                *existing = pick;
                event.last_pick_sys_time = now;
                return PickDisposition::Accepted;
            }
            return PickDisposition::Deduplicated;
        }
        // Same station re-picked later in the event: refresh liveness only.
        event.last_pick_time = event.last_pick_time.max(pick.pick_time);
        event.last_pick_sys_time = now;
        return PickDisposition::Deduplicated;
    }

    if pick.pick_time > event.last_pick_time + linger {
        return PickDisposition::Rejected;
    }
    event.last_pick_time = event.last_pick_time.max(pick.pick_time);
    event.last_pick_sys_time = now;
    event.accepted.insert(pick.station.clone(), pick);
    PickDisposition::Accepted
}

fn build_tick(event: &EventState, now: f64, tick_interval: f64, terminal: bool) -> TickRequest {
    let tick_index = event.next_tick_index;
    let mut order: Vec<StationPick> = event
        .accepted
        .values()
        .map(|p| StationPick {
            station: p.station.clone(),
            pick_time: p.pick_time,
        })
        .collect();
    order.sort_by(|a, b| {
        a.pick_time
            .total_cmp(&b.pick_time)
            .then_with(|| a.station.cmp(&b.station))
    });

    TickRequest {
        event_id: event.event_id,
        tick_index,
        wave_end_time: now.min(event.last_pick_time + tick_interval * tick_index as f64),
        first_pick_time: event.first_pick_time,
        station_pick_order: order,
        terminal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StationMeta;

    fn close_station(lat: f64, lon: f64) -> StationMeta {
        StationMeta {
            latitude: lat,
            longitude: lon,
            elevation_m: 10.0,
            vs30: Some(500.0),
            site_class: None,
        }
    }

    /// Three stations within ~15 km of each other plus one far away.
    fn catalog() -> Arc<StationCatalog> {
        Arc::new(StationCatalog::from_entries([
            ("S1".to_string(), close_station(23.50, 121.00)),
            ("S2".to_string(), close_station(23.55, 121.05)),
            ("S3".to_string(), close_station(23.60, 121.00)),
            ("S4".to_string(), close_station(23.52, 121.02)),
            ("FAR".to_string(), close_station(20.00, 118.00)),
        ]))
    }

    fn aggregator() -> PickAggregator {
        PickAggregator::new(&Config::default(), catalog())
    }

    fn p_pick(station: &str, time: f64, weight: f64) -> Pick {
        Pick {
            station: station.to_string(),
            phase: Phase::P,
            pick_time: time,
            weight,
            amplitude_proxy: 0.1,
        }
    }

    #[test]
    fn no_event_below_minimum_stations() {
        let mut agg = aggregator();
        agg.on_pick(&p_pick("S1", 100.0, 1.0), 100.0);
        agg.on_pick(&p_pick("S2", 100.5, 1.0), 100.5);
        assert!(!agg.is_active());
        assert_eq!(agg.stats().events_started, 0);
    }

    #[test]
    fn event_starts_on_last_qualifying_pick() {
        let mut agg = aggregator();
        agg.on_pick(&p_pick("S1", 100.0, 1.0), 100.0);
        agg.on_pick(&p_pick("S2", 100.5, 1.0), 100.5);
        assert!(!agg.is_active());
        agg.on_pick(&p_pick("S3", 101.0, 1.0), 101.0);
        assert!(agg.is_active());
        assert_eq!(agg.stats().events_started, 1);
    }

    #[test]
    fn distant_station_does_not_satisfy_spatial_gate() {
        let mut agg = aggregator();
        agg.on_pick(&p_pick("S1", 100.0, 1.0), 100.0);
        agg.on_pick(&p_pick("S2", 100.5, 1.0), 100.5);
        agg.on_pick(&p_pick("FAR", 101.0, 1.0), 101.0);
        assert!(!agg.is_active());
    }

    #[test]
    fn s_phase_and_unknown_stations_are_ignored() {
        let mut agg = aggregator();
        let s_pick = Pick {
            phase: Phase::S,
            ..p_pick("S1", 100.0, 1.0)
        };
        assert_eq!(
            agg.on_pick(&s_pick, 100.0).disposition,
            PickDisposition::Rejected
        );
        assert_eq!(
            agg.on_pick(&p_pick("NOPE", 100.0, 1.0), 100.0).disposition,
            PickDisposition::UnknownStation
        );
    }

    #[test]
    fn duplicate_keeps_higher_weight() {
        let mut agg = aggregator();
        agg.on_pick(&p_pick("S1", 100.0, 2.0), 100.0);
        let outcome = agg.on_pick(&p_pick("S1", 100.1, 1.0), 100.1);
        assert_eq!(outcome.disposition, PickDisposition::Deduplicated);
        assert_eq!(agg.stats().picks_deduplicated, 1);

        // The higher-weight challenger replaces.
        let outcome = agg.on_pick(&p_pick("S1", 100.2, 3.0), 100.2);
        assert_eq!(outcome.disposition, PickDisposition::Accepted);
    }

    #[test]
    fn duplicate_tie_keeps_earlier_pick_time() {
        let mut agg = aggregator();
        agg.on_pick(&p_pick("S1", 100.0, 2.0), 100.0);
        let outcome = agg.on_pick(&p_pick("S1", 100.2, 2.0), 100.2);
        assert_eq!(outcome.disposition, PickDisposition::Deduplicated);
    }

    #[test]
    fn dedup_inside_active_event() {
        let mut agg = aggregator();
        agg.on_pick(&p_pick("S1", 100.0, 2.0), 100.0);
        agg.on_pick(&p_pick("S2", 100.5, 1.0), 100.5);
        agg.on_pick(&p_pick("S3", 101.0, 1.0), 101.0);
        assert!(agg.is_active());

        let outcome = agg.on_pick(&p_pick("S1", 100.1, 1.0), 101.2);
        assert_eq!(outcome.disposition, PickDisposition::Deduplicated);
        assert_eq!(agg.stats().picks_deduplicated, 1);
    }

    #[test]
    fn first_tick_fires_at_initial_delay() {
        let mut agg = aggregator();
        agg.on_pick(&p_pick("S1", 100.0, 1.0), 100.0);
        agg.on_pick(&p_pick("S2", 100.5, 1.0), 100.5);
        agg.on_pick(&p_pick("S3", 101.0, 1.0), 101.0);

        assert!(agg.on_timer(102.9).is_empty());
        let ticks = agg.on_timer(103.05);
        assert_eq!(ticks.len(), 1);
        let tick = &ticks[0];
        assert_eq!(tick.tick_index, 1);
        assert_eq!(tick.event_id, 1);
        assert_eq!(tick.first_pick_time, 100.0);
        assert_eq!(tick.picks_count(), 3);
        assert!(!tick.terminal);
        // wave_end = min(now, last_pick + interval * 1)
        assert!((tick.wave_end_time - 102.0).abs() < 1e-9);
    }

    #[test]
    fn ticks_are_strictly_increasing() {
        let mut agg = aggregator();
        agg.on_pick(&p_pick("S1", 100.0, 1.0), 100.0);
        agg.on_pick(&p_pick("S2", 100.5, 1.0), 100.5);
        agg.on_pick(&p_pick("S3", 101.0, 1.0), 101.0);

        let mut indices = Vec::new();
        let mut t = 103.0;
        while t < 108.0 {
            for tick in agg.on_timer(t) {
                indices.push(tick.tick_index);
            }
            t += 0.1;
        }
        assert!(!indices.is_empty());
        assert!(indices.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn event_drains_to_terminal_tick() {
        let mut agg = aggregator();
        agg.on_pick(&p_pick("S1", 100.0, 1.0), 100.0);
        agg.on_pick(&p_pick("S2", 100.5, 1.0), 100.5);
        agg.on_pick(&p_pick("S3", 101.0, 1.0), 101.0);

        // Drain window measured from the last accepted pick arrival.
        let ticks = agg.on_timer(101.0 + 30.0);
        assert_eq!(ticks.len(), 1);
        assert!(ticks[0].terminal);
        assert!(!agg.is_active());

        // Next event reuses nothing from the first.
        agg.on_pick(&p_pick("S1", 200.0, 1.0), 200.0);
        agg.on_pick(&p_pick("S2", 200.2, 1.0), 200.2);
        agg.on_pick(&p_pick("S4", 200.4, 1.0), 200.4);
        assert!(agg.is_active());
        let ticks = agg.on_timer(203.1);
        assert_eq!(ticks[0].event_id, 2);
        assert_eq!(ticks[0].tick_index, 1);
    }

    #[test]
    fn station_order_is_pick_time_then_station() {
        let mut agg = aggregator();
        agg.on_pick(&p_pick("S3", 100.0, 1.0), 100.0);
        agg.on_pick(&p_pick("S1", 100.0, 1.0), 100.1);
        agg.on_pick(&p_pick("S2", 100.5, 1.0), 100.5);

        let ticks = agg.on_timer(103.1);
        let order: Vec<&str> = ticks[0]
            .station_pick_order
            .iter()
            .map(|p| p.station.as_str())
            .collect();
        assert_eq!(order, ["S1", "S3", "S2"]);
    }

    #[test]
    fn linger_gates_late_picks() {
        let mut agg = aggregator();
        agg.on_pick(&p_pick("S1", 100.0, 1.0), 100.0);
        agg.on_pick(&p_pick("S2", 100.5, 1.0), 100.5);
        agg.on_pick(&p_pick("S3", 101.0, 1.0), 101.0);
        assert!(agg.is_active());

        // Within linger of the latest accepted pick: accepted.
        let outcome = agg.on_pick(&p_pick("S4", 115.0, 1.0), 115.0);
        assert_eq!(outcome.disposition, PickDisposition::Accepted);

        // Far beyond linger of the (new) latest pick: rejected.
        let late = agg.on_pick(&p_pick("FAR", 140.0, 1.0), 140.0);
        assert_eq!(late.disposition, PickDisposition::Rejected);
    }
}
