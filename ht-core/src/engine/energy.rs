//! Energy ledger
//!
//! Two jobs, kept apart:
//!
//! 1. **Stored energy**: the tank is split into equal-volume segments, one per
//!    sensor, and each segment's heat above the reference temperature is
//!    summed. The result is clamped to the tank's physical range and any
//!    clamping is reported as a fault.
//! 2. **Collected energy**: a positive change in stored energy between two
//!    cycles is split across the heat sources active at the time. Losses are
//!    never allocated.
//!
//! Accumulators count integer milliwatt-hours. Every allocation is split so
//! the shares add up to the delta exactly, and the per-source accumulators
//! are the only running totals: a combined total is always their sum.

use std::collections::BTreeMap;

use ht_protocol::{EnergyState, HeatSource, TemperatureSnapshot};
use tracing::{debug, info, warn};

use crate::constants::{allocation, tank};
use crate::settings::TankSettings;

/// Shares of one delta per source, in milliwatt-hours
pub type Allocation = BTreeMap<HeatSource, u64>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EnergyFault {
    /// Snapshot implies more energy than the tank can physically hold
    AboveMaximum { raw_kwh: f64, max_kwh: f64 },
    /// Snapshot implies the tank is colder than the reference temperature
    BelowZero { raw_kwh: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEnergy {
    /// Clamped stored energy; `None` when no segment had a value
    pub kwh: Option<f64>,
    /// Which segments contributed, top to bottom
    pub coverage: Vec<bool>,
    pub fault: Option<EnergyFault>,
}

impl StoredEnergy {
    pub fn segments_used(&self) -> usize {
        self.coverage.iter().filter(|c| **c).count()
    }

    fn mwh(&self) -> Option<u64> {
        self.kwh.map(kwh_to_mwh)
    }
}

/// Heat sources running during the cycle
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ActiveSources {
    /// Pump circulating through the collector
    pub solar: bool,
    /// Collector minus tank reference, when both are known
    pub collector_tank_dt: Option<f64>,
    /// Cartridge heater relay on
    pub cartridge: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct SourceAccumulator {
    hour_mwh: u64,
    today_mwh: u64,
}

/// Outcome of folding one snapshot into the ledger
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerUpdate {
    pub stored: StoredEnergy,
    /// Positive delta since the previous comparable snapshot, if any
    pub delta_mwh: Option<u64>,
    pub allocation: Option<Allocation>,
}

pub struct EnergyLedger {
    segment_ids: Vec<String>,
    segment_mass_kg: f64,
    specific_heat_kj: f64,
    reference_temp_c: f64,
    max_energy_kwh: f64,
    previous: Option<StoredEnergy>,
    last_stored_kwh: Option<f64>,
    accumulators: BTreeMap<HeatSource, SourceAccumulator>,
}

pub fn kwh_to_mwh(kwh: f64) -> u64 {
    (kwh.max(0.0) * tank::MWH_PER_KWH).round() as u64
}

pub fn mwh_to_kwh(mwh: u64) -> f64 {
    mwh as f64 / tank::MWH_PER_KWH
}

impl EnergyLedger {
    /// `segment_ids` lists the tank sensors top to bottom, one per segment
    pub fn new(segment_ids: Vec<String>, settings: &TankSettings) -> Self {
        let segments = segment_ids.len().max(1) as f64;
        Self {
            segment_mass_kg: settings.volume_litres / segments,
            specific_heat_kj: settings.specific_heat_kj,
            reference_temp_c: settings.reference_temp_c,
            max_energy_kwh: settings.max_energy_kwh(),
            segment_ids,
            previous: None,
            last_stored_kwh: None,
            accumulators: HeatSource::ALL
                .iter()
                .map(|s| (*s, SourceAccumulator::default()))
                .collect(),
        }
    }

    pub fn max_energy_kwh(&self) -> f64 {
        self.max_energy_kwh
    }

    /// Stored energy above the reference temperature.
    ///
    /// Absent segments are skipped rather than read as 0°C, which would
    /// subtract their whole volume; the figure then covers only the segments
    /// present, as recorded in [`StoredEnergy::coverage`].
    pub fn compute_stored_energy(&self, snapshot: &TemperatureSnapshot) -> StoredEnergy {
        let mut coverage = Vec::with_capacity(self.segment_ids.len());
        let mut raw_kwh = 0.0;

        for id in &self.segment_ids {
            match snapshot.get(id).copied().flatten() {
                Some(temp) => {
                    coverage.push(true);
                    raw_kwh += self.segment_mass_kg * self.specific_heat_kj * (temp - self.reference_temp_c)
                        / tank::KJ_PER_KWH;
                }
                None => coverage.push(false),
            }
        }

        if !coverage.iter().any(|c| *c) {
            return StoredEnergy {
                kwh: None,
                coverage,
                fault: None,
            };
        }

        let (kwh, fault) = if raw_kwh > self.max_energy_kwh {
            warn!(
                raw_kwh,
                max_kwh = self.max_energy_kwh,
                "ENERGY: stored energy above tank maximum, check sensor calibration"
            );
            (
                self.max_energy_kwh,
                Some(EnergyFault::AboveMaximum {
                    raw_kwh,
                    max_kwh: self.max_energy_kwh,
                }),
            )
        } else if raw_kwh < 0.0 {
            warn!(raw_kwh, "ENERGY: stored energy below zero, check sensor calibration");
            (0.0, Some(EnergyFault::BelowZero { raw_kwh }))
        } else {
            (raw_kwh, None)
        };

        StoredEnergy {
            kwh: Some(kwh),
            coverage,
            fault,
        }
    }

    /// Per-source weights for the given activity
    pub fn weights(active: &ActiveSources) -> BTreeMap<HeatSource, f64> {
        let mut weights = BTreeMap::new();
        if active.solar {
            let dt = active.collector_tank_dt.unwrap_or(0.0);
            let weight = (dt / allocation::SOLAR_FULL_WEIGHT_DT)
                .clamp(allocation::SOLAR_MIN_WEIGHT, allocation::SOLAR_MAX_WEIGHT);
            weights.insert(HeatSource::Solar, weight);
        }
        if active.cartridge {
            weights.insert(HeatSource::Cartridge, allocation::CARTRIDGE_WEIGHT);
        }
        if weights.is_empty() {
            weights.insert(HeatSource::Pellet, allocation::PELLET_WEIGHT);
        }
        weights
    }

    /// Split `delta_mwh` by weight. Shares always sum to `delta_mwh` exactly.
    pub fn allocate_collected_mwh(delta_mwh: u64, active: &ActiveSources) -> Allocation {
        let weights = Self::weights(active);
        let total: f64 = weights.values().sum();

        // Cumulative rounding: each source gets the step between consecutive
        // floored prefix sums, the last prefix being the delta itself.
        let mut shares = Allocation::new();
        let mut cumulative_weight = 0.0;
        let mut allocated = 0u64;
        let count = weights.len();
        for (index, (source, weight)) in weights.into_iter().enumerate() {
            cumulative_weight += weight;
            let prefix = if index + 1 == count {
                delta_mwh
            } else {
                ((delta_mwh as f64 * cumulative_weight / total).floor() as u64).clamp(allocated, delta_mwh)
            };
            shares.insert(source, prefix - allocated);
            allocated = prefix;
        }
        shares
    }

    /// kWh convenience form of [`EnergyLedger::allocate_collected_mwh`]
    pub fn allocate_collected(delta_kwh: f64, active: &ActiveSources) -> BTreeMap<HeatSource, f64> {
        Self::allocate_collected_mwh(kwh_to_mwh(delta_kwh), active)
            .into_iter()
            .map(|(source, mwh)| (source, mwh_to_kwh(mwh)))
            .collect()
    }

    /// Fold one sanitized snapshot into the ledger.
    ///
    /// A delta is only computed against a previous figure built from the same
    /// segments; when coverage changes the ledger re-baselines instead.
    pub fn update(&mut self, snapshot: &TemperatureSnapshot, active: &ActiveSources) -> LedgerUpdate {
        let stored = self.compute_stored_energy(snapshot);
        self.last_stored_kwh = stored.kwh;

        let comparable = match (&self.previous, stored.mwh()) {
            (Some(previous), Some(current)) if previous.coverage == stored.coverage => {
                previous.mwh().map(|prev| (prev, current))
            }
            (Some(previous), Some(_)) => {
                info!(
                    before = previous.segments_used(),
                    after = stored.segments_used(),
                    "ENERGY: tank sensor coverage changed, re-baselining"
                );
                None
            }
            _ => None,
        };

        let mut update = LedgerUpdate {
            stored: stored.clone(),
            delta_mwh: None,
            allocation: None,
        };

        if let Some((previous, current)) = comparable {
            if current > previous {
                let delta = current - previous;
                let shares = Self::allocate_collected_mwh(delta, active);
                self.credit(&shares);
                debug!(delta_mwh = delta, ?shares, "ENERGY: collected energy allocated");
                update.delta_mwh = Some(delta);
                update.allocation = Some(shares);
            }
        }

        self.previous = stored.kwh.map(|_| stored);
        update
    }

    /// The single place accumulators grow
    fn credit(&mut self, shares: &Allocation) {
        for (source, mwh) in shares {
            let acc = self.accumulators.entry(*source).or_default();
            acc.hour_mwh = acc.hour_mwh.saturating_add(*mwh);
            acc.today_mwh = acc.today_mwh.saturating_add(*mwh);
        }
    }

    pub fn reset_hour(&mut self) {
        for acc in self.accumulators.values_mut() {
            acc.hour_mwh = 0;
        }
    }

    pub fn reset_day(&mut self) {
        for acc in self.accumulators.values_mut() {
            acc.today_mwh = 0;
        }
    }

    pub fn today_mwh(&self, source: HeatSource) -> u64 {
        self.accumulators.get(&source).map(|a| a.today_mwh).unwrap_or(0)
    }

    pub fn hour_mwh(&self, source: HeatSource) -> u64 {
        self.accumulators.get(&source).map(|a| a.hour_mwh).unwrap_or(0)
    }

    /// Collected since the last day reset, derived from the sources
    pub fn total_today_mwh(&self) -> u64 {
        HeatSource::ALL.iter().map(|s| self.today_mwh(*s)).sum()
    }

    pub fn total_hour_mwh(&self) -> u64 {
        HeatSource::ALL.iter().map(|s| self.hour_mwh(*s)).sum()
    }

    pub fn state(&self) -> EnergyState {
        let today = |s| mwh_to_kwh(self.today_mwh(s));
        let hour = |s| mwh_to_kwh(self.hour_mwh(s));
        EnergyState {
            stored_energy_kwh: self.last_stored_kwh,
            solar_today: today(HeatSource::Solar),
            solar_hour: hour(HeatSource::Solar),
            cartridge_today: today(HeatSource::Cartridge),
            cartridge_hour: hour(HeatSource::Cartridge),
            pellet_today: today(HeatSource::Pellet),
            pellet_hour: hour(HeatSource::Pellet),
        }
    }
}
