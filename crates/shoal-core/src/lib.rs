//! Age- and sex-structured fish stock dynamics over a spatial cell arena.
//!
//! The engine tracks per-cell fish abundance (counts by sex and age bin) or
//! scalar biomass, applies natural mortality, aging, and recruitment on a
//! yearly cadence, moves biomass between neighboring cells daily, and can
//! redistribute aggregate stock across the arena by habitat weights. Every
//! stochastic decision draws from one seeded generator threaded explicitly
//! through the call, so a fixed seed reproduces a run exactly.

use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

new_key_type! {
    /// Stable handle for map cells backed by a generational slot map.
    pub struct CellId;
}

new_key_type! {
    /// Cancellation handle returned when a process is registered.
    pub struct TaskId;
}

/// Convenience alias for associating side data with cells.
pub type CellMap<T> = SecondaryMap<CellId, T>;

/// Subdivision index holding female counts.
pub const FEMALE: usize = 0;
/// Subdivision index holding male counts.
pub const MALE: usize = 1;

/// Cutoff below which residual biomass is not worth redistributing.
const EPSILON: f64 = 1e-6;

/// Errors surfaced by the stock engine.
#[derive(Debug, Error)]
pub enum StockError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The weight map and the registered cell set disagree.
    #[error("weight map coverage mismatch: {0}")]
    WeightCoverage(&'static str),
    /// A cell was registered twice with the same process.
    #[error("cell already tracked by this process")]
    DuplicateCell,
    /// A species index does not exist in the registry.
    #[error("species index {0} is out of range")]
    UnknownSpecies(usize),
}

/// Monotonic simulation tick counter. One tick is one simulated day.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Tick(pub u64);

impl Tick {
    /// Tick zero, before any stepping has happened.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// The tick following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Static configuration for a stock world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockConfig {
    /// Number of daily ticks per simulated year; biology runs on year ends.
    pub days_per_year: u32,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Maximum number of recent stock summaries retained in memory.
    pub history_capacity: usize,
    /// Interval (ticks) between observation batches; 0 disables observation.
    pub observation_interval: u32,
}

impl Default for StockConfig {
    fn default() -> Self {
        Self {
            days_per_year: 365,
            rng_seed: None,
            history_capacity: 256,
            observation_interval: 1,
        }
    }
}

impl StockConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), StockError> {
        if self.days_per_year == 0 {
            return Err(StockError::InvalidConfig("days_per_year must be non-zero"));
        }
        if self.history_capacity == 0 {
            return Err(StockError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy if no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Per-species life-history table indexed by subdivision (sex) and age bin.
///
/// All rows are validated against the bin count at construction; downstream
/// code indexes without further checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meristics {
    subdivisions: usize,
    bins: usize,
    weight: Vec<Vec<f64>>,
    length: Vec<Vec<f64>>,
    maturity: Vec<f64>,
    relative_fecundity: Option<Vec<f64>>,
    mortality: Vec<Vec<f64>>,
}

impl Meristics {
    /// Builds a validated life-history table.
    ///
    /// `weight`, `length`, and `mortality` are `[subdivision][bin]`;
    /// `maturity` and `relative_fecundity` are per-bin.
    pub fn new(
        weight: Vec<Vec<f64>>,
        length: Vec<Vec<f64>>,
        maturity: Vec<f64>,
        relative_fecundity: Option<Vec<f64>>,
        mortality: Vec<Vec<f64>>,
    ) -> Result<Self, StockError> {
        let subdivisions = weight.len();
        if subdivisions == 0 {
            return Err(StockError::InvalidConfig(
                "meristics need at least one subdivision",
            ));
        }
        let bins = weight[0].len();
        if bins == 0 {
            return Err(StockError::InvalidConfig(
                "meristics need at least one age bin",
            ));
        }
        if weight.iter().any(|row| row.len() != bins) {
            return Err(StockError::InvalidConfig(
                "weight rows must all match the bin count",
            ));
        }
        if length.len() != subdivisions || length.iter().any(|row| row.len() != bins) {
            return Err(StockError::InvalidConfig(
                "length table must match weight dimensions",
            ));
        }
        if mortality.len() != subdivisions || mortality.iter().any(|row| row.len() != bins) {
            return Err(StockError::InvalidConfig(
                "mortality table must match weight dimensions",
            ));
        }
        if maturity.len() != bins {
            return Err(StockError::InvalidConfig(
                "maturity schedule must match the bin count",
            ));
        }
        if let Some(fecundity) = &relative_fecundity {
            if fecundity.len() != bins {
                return Err(StockError::InvalidConfig(
                    "relative fecundity must match the bin count",
                ));
            }
        }
        Ok(Self {
            subdivisions,
            bins,
            weight,
            length,
            maturity,
            relative_fecundity,
            mortality,
        })
    }

    /// Degenerate one-by-one table for species governed purely by biomass.
    #[must_use]
    pub fn scalar(weight_per_unit: f64) -> Self {
        Self {
            subdivisions: 1,
            bins: 1,
            weight: vec![vec![weight_per_unit]],
            length: vec![vec![0.0]],
            maturity: vec![1.0],
            relative_fecundity: None,
            mortality: vec![vec![0.0]],
        }
    }

    #[must_use]
    pub const fn subdivisions(&self) -> usize {
        self.subdivisions
    }

    #[must_use]
    pub const fn bins(&self) -> usize {
        self.bins
    }

    /// Body weight of one individual in `(subdivision, bin)`.
    #[must_use]
    pub fn weight(&self, subdivision: usize, bin: usize) -> f64 {
        self.weight[subdivision][bin]
    }

    /// Body length of one individual in `(subdivision, bin)`.
    #[must_use]
    pub fn length(&self, subdivision: usize, bin: usize) -> f64 {
        self.length[subdivision][bin]
    }

    /// Per-bin fraction of mature individuals.
    #[must_use]
    pub fn maturity(&self) -> &[f64] {
        &self.maturity
    }

    /// Optional per-bin fecundity weighting applied on top of maturity.
    #[must_use]
    pub fn relative_fecundity(&self) -> Option<&[f64]> {
        self.relative_fecundity.as_deref()
    }

    /// Instantaneous natural mortality rate for `(subdivision, bin)`.
    #[must_use]
    pub fn mortality(&self, subdivision: usize, bin: usize) -> f64 {
        self.mortality[subdivision][bin]
    }
}

/// Immutable species identity plus life-history parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Species {
    name: String,
    code: String,
    imaginary: bool,
    meristics: Meristics,
}

impl Species {
    /// A real species participating in population dynamics.
    pub fn new(name: impl Into<String>, code: impl Into<String>, meristics: Meristics) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
            imaginary: false,
            meristics,
        }
    }

    /// A catch-all residual species excluded from dynamics.
    pub fn imaginary(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
            imaginary: true,
            meristics: Meristics::scalar(1.0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    #[must_use]
    pub const fn is_imaginary(&self) -> bool {
        self.imaginary
    }

    #[must_use]
    pub const fn meristics(&self) -> &Meristics {
        &self.meristics
    }

    /// Spawning biomass: mass of mature females, fecundity-weighted when the
    /// species defines a relative fecundity schedule.
    #[must_use]
    pub fn spawning_biomass(&self, total: &Abundance) -> f64 {
        let meristics = &self.meristics;
        let mut ssb = 0.0;
        for bin in 0..meristics.bins() {
            let mut contribution =
                meristics.weight(FEMALE, bin) * meristics.maturity()[bin] * total.get(FEMALE, bin);
            if let Some(fecundity) = meristics.relative_fecundity() {
                contribution *= fecundity[bin];
            }
            ssb += contribution;
        }
        ssb
    }
}

/// Immutable, ordered list of the species in play. Species are addressed by
/// their dense index everywhere else in the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesRegistry {
    species: Vec<Species>,
}

impl SpeciesRegistry {
    /// Builds a registry; at least one species is required.
    pub fn new(species: Vec<Species>) -> Result<Self, StockError> {
        if species.is_empty() {
            return Err(StockError::InvalidConfig(
                "registry needs at least one species",
            ));
        }
        Ok(Self { species })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.species.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.species.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Species> {
        self.species.get(index)
    }

    /// Looks a species up by name, returning its dense index.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<(usize, &Species)> {
        self.species
            .iter()
            .enumerate()
            .find(|(_, species)| species.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Species> {
        self.species.iter()
    }
}

/// Non-negative count matrix indexed by `[subdivision][bin]`, stored row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Abundance {
    subdivisions: usize,
    bins: usize,
    counts: Vec<f64>,
}

impl Abundance {
    /// All-zero matrix with the given dimensions.
    #[must_use]
    pub fn zeros(subdivisions: usize, bins: usize) -> Self {
        Self {
            subdivisions,
            bins,
            counts: vec![0.0; subdivisions * bins],
        }
    }

    #[inline]
    fn offset(&self, subdivision: usize, bin: usize) -> usize {
        subdivision * self.bins + bin
    }

    #[must_use]
    pub const fn subdivisions(&self) -> usize {
        self.subdivisions
    }

    #[must_use]
    pub const fn bins(&self) -> usize {
        self.bins
    }

    #[must_use]
    pub fn get(&self, subdivision: usize, bin: usize) -> f64 {
        self.counts[self.offset(subdivision, bin)]
    }

    pub fn set(&mut self, subdivision: usize, bin: usize, value: f64) {
        let idx = self.offset(subdivision, bin);
        self.counts[idx] = value;
    }

    pub fn add(&mut self, subdivision: usize, bin: usize, delta: f64) {
        let idx = self.offset(subdivision, bin);
        self.counts[idx] += delta;
    }

    /// One subdivision's counts across all bins.
    #[must_use]
    pub fn row(&self, subdivision: usize) -> &[f64] {
        &self.counts[subdivision * self.bins..(subdivision + 1) * self.bins]
    }

    pub fn row_mut(&mut self, subdivision: usize) -> &mut [f64] {
        &mut self.counts[subdivision * self.bins..(subdivision + 1) * self.bins]
    }

    /// Sum over every entry.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.counts.iter().sum()
    }

    /// Adds another matrix of identical dimensions entry-wise.
    pub fn accumulate(&mut self, other: &Abundance) {
        debug_assert_eq!(self.subdivisions, other.subdivisions);
        debug_assert_eq!(self.bins, other.bins);
        for (mine, theirs) in self.counts.iter_mut().zip(&other.counts) {
            *mine += theirs;
        }
    }

    /// Entry-wise scaled copy.
    #[must_use]
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            subdivisions: self.subdivisions,
            bins: self.bins,
            counts: self.counts.iter().map(|count| count * factor).collect(),
        }
    }

    /// Total mass implied by per-bin body weights.
    #[must_use]
    pub fn biomass(&self, meristics: &Meristics) -> f64 {
        let mut mass = 0.0;
        for subdivision in 0..self.subdivisions {
            for bin in 0..self.bins {
                mass += self.get(subdivision, bin) * meristics.weight(subdivision, bin);
            }
        }
        mass
    }
}

/// Scalar biomass plus an independent carrying capacity, one slot per species.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiomassStock {
    biomass: Vec<f64>,
    capacity: Vec<f64>,
}

impl BiomassStock {
    /// Empty stock with zero biomass and zero capacity for every species.
    #[must_use]
    pub fn new(species_count: usize) -> Self {
        Self {
            biomass: vec![0.0; species_count],
            capacity: vec![0.0; species_count],
        }
    }

    #[must_use]
    pub fn biomass(&self, species: usize) -> f64 {
        self.biomass.get(species).copied().unwrap_or(0.0)
    }

    #[must_use]
    pub fn capacity(&self, species: usize) -> f64 {
        self.capacity.get(species).copied().unwrap_or(0.0)
    }

    /// Sets the carrying capacity, clamping current biomass down if it now
    /// exceeds the ceiling. Non-finite or negative capacities become zero.
    pub fn set_capacity(&mut self, species: usize, capacity: f64) {
        let capacity = if capacity.is_finite() {
            capacity.max(0.0)
        } else {
            0.0
        };
        if let Some(slot) = self.capacity.get_mut(species) {
            *slot = capacity;
        }
        if let Some(slot) = self.biomass.get_mut(species) {
            if *slot > capacity {
                *slot = capacity;
            }
        }
    }

    /// Writes a biomass value clamped into `[0, capacity]`, returning what
    /// was actually stored. Non-finite writes store zero.
    pub fn set_biomass(&mut self, species: usize, value: f64) -> f64 {
        let ceiling = self.capacity(species);
        let clamped = if value.is_finite() {
            value.clamp(0.0, ceiling)
        } else {
            0.0
        };
        if let Some(slot) = self.biomass.get_mut(species) {
            *slot = clamped;
        }
        clamped
    }

    /// Adjusts biomass by a signed delta, clamped like [`Self::set_biomass`].
    pub fn add_biomass(&mut self, species: usize, delta: f64) -> f64 {
        self.set_biomass(species, self.biomass(species) + delta)
    }
}

/// Per-species abundance matrices with a lazily cached biomass scalar.
///
/// The cache entry for a species is poisoned with NaN whenever its matrix is
/// borrowed mutably; reads recompute from the matrix until the cache is
/// warmed again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbundanceStock {
    matrices: Vec<Abundance>,
    cached_biomass: Vec<f64>,
}

impl AbundanceStock {
    /// Zeroed matrices sized from each species' meristics.
    #[must_use]
    pub fn new(registry: &SpeciesRegistry) -> Self {
        let matrices: Vec<Abundance> = registry
            .iter()
            .map(|species| {
                let meristics = species.meristics();
                Abundance::zeros(meristics.subdivisions(), meristics.bins())
            })
            .collect();
        let cached_biomass = vec![f64::NAN; matrices.len()];
        Self {
            matrices,
            cached_biomass,
        }
    }

    #[must_use]
    pub fn abundance(&self, species: usize) -> Option<&Abundance> {
        self.matrices.get(species)
    }

    /// Mutable matrix access; invalidates the cached biomass for the species.
    pub fn abundance_mut(&mut self, species: usize) -> Option<&mut Abundance> {
        if let Some(slot) = self.cached_biomass.get_mut(species) {
            *slot = f64::NAN;
        }
        self.matrices.get_mut(species)
    }

    /// Biomass for one species, from cache when warm.
    #[must_use]
    pub fn biomass(&self, species: usize, meristics: &Meristics) -> f64 {
        match self.cached_biomass.get(species) {
            Some(cached) if !cached.is_nan() => *cached,
            _ => self
                .matrices
                .get(species)
                .map_or(0.0, |matrix| matrix.biomass(meristics)),
        }
    }

    /// Recomputes and stores every species' biomass.
    pub fn warm_cache(&mut self, registry: &SpeciesRegistry) {
        for (index, matrix) in self.matrices.iter().enumerate() {
            if let (Some(slot), Some(species)) =
                (self.cached_biomass.get_mut(index), registry.get(index))
            {
                *slot = matrix.biomass(species.meristics());
            }
        }
    }
}

/// Stock state owned exclusively by one map cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LocalStock {
    /// Land or wasteland; reads are zero, writes are no-ops.
    Empty,
    /// Fixed biomass that no process ever mutates.
    Constant(BiomassStock),
    /// Scalar biomass with carrying capacity, for biomass-governed species.
    Biomass(BiomassStock),
    /// Structured counts for age/sex-governed species.
    Abundance(AbundanceStock),
}

impl LocalStock {
    /// Biomass held here for one species.
    #[must_use]
    pub fn biomass_of(&self, index: usize, species: &Species) -> f64 {
        match self {
            Self::Empty => 0.0,
            Self::Constant(stock) | Self::Biomass(stock) => stock.biomass(index),
            Self::Abundance(stock) => stock.biomass(index, species.meristics()),
        }
    }

    /// Carrying capacity for one species; abundance cells are unbounded.
    #[must_use]
    pub fn capacity_of(&self, index: usize) -> f64 {
        match self {
            Self::Empty => 0.0,
            Self::Constant(stock) | Self::Biomass(stock) => stock.capacity(index),
            Self::Abundance(_) => f64::INFINITY,
        }
    }

    #[must_use]
    pub const fn is_habitable(&self) -> bool {
        !matches!(self, Self::Empty)
    }

    #[must_use]
    pub fn abundance(&self, species: usize) -> Option<&Abundance> {
        match self {
            Self::Abundance(stock) => stock.abundance(species),
            _ => None,
        }
    }

    pub fn abundance_mut(&mut self, species: usize) -> Option<&mut Abundance> {
        match self {
            Self::Abundance(stock) => stock.abundance_mut(species),
            _ => None,
        }
    }

    /// Irreversibly converts the cell to wasteland.
    pub fn make_wasteland(&mut self) {
        *self = Self::Empty;
    }
}

/// Arena of per-cell stock containers plus the neighbor topology declared by
/// the external map. Topology is append-only; the engine never mutates it.
#[derive(Debug, Clone, Default)]
pub struct CellArena {
    cells: SlotMap<CellId, LocalStock>,
    pairs: Vec<(CellId, CellId)>,
}

impl CellArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, stock: LocalStock) -> CellId {
        self.cells.insert(stock)
    }

    /// Declares two cells adjacent. Pairs are stored unordered and visited
    /// exactly once per movement pass; duplicates and self-pairs are ignored.
    pub fn connect(&mut self, a: CellId, b: CellId) {
        if a == b || !self.cells.contains_key(a) || !self.cells.contains_key(b) {
            return;
        }
        let pair = if a < b { (a, b) } else { (b, a) };
        if !self.pairs.contains(&pair) {
            self.pairs.push(pair);
        }
    }

    #[must_use]
    pub fn get(&self, id: CellId) -> Option<&LocalStock> {
        self.cells.get(id)
    }

    #[must_use]
    pub fn get_mut(&mut self, id: CellId) -> Option<&mut LocalStock> {
        self.cells.get_mut(id)
    }

    #[must_use]
    pub fn contains(&self, id: CellId) -> bool {
        self.cells.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = CellId> + '_ {
        self.cells.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CellId, &LocalStock)> {
        self.cells.iter()
    }

    /// Ids of all cells that are not wasteland.
    #[must_use]
    pub fn habitable_ids(&self) -> Vec<CellId> {
        self.cells
            .iter()
            .filter(|(_, stock)| stock.is_habitable())
            .map(|(id, _)| id)
            .collect()
    }

    #[must_use]
    pub fn pairs(&self) -> &[(CellId, CellId)] {
        &self.pairs
    }

    /// Total biomass of one species over every cell.
    #[must_use]
    pub fn total_biomass(&self, index: usize, species: &Species) -> f64 {
        self.cells
            .values()
            .map(|stock| stock.biomass_of(index, species))
            .sum()
    }
}

/// Per-cell relative allocation weights for one species. Not normalized by
/// contract; normalization happens at the point of use.
#[derive(Debug, Clone, Default)]
pub struct WeightMap {
    weights: CellMap<f64>,
}

impl WeightMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, cell: CellId, weight: f64) {
        self.weights.insert(cell, weight);
    }

    #[must_use]
    pub fn get(&self, cell: CellId) -> Option<f64> {
        self.weights.get(cell).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Checks that the weighted cell set exactly matches `cells`: no orphan
    /// weights, no uncovered cells.
    pub fn validate_coverage(&self, cells: &[CellId]) -> Result<(), StockError> {
        for &cell in cells {
            if !self.weights.contains_key(cell) {
                return Err(StockError::WeightCoverage(
                    "a registered cell has no weight",
                ));
            }
        }
        if self.weights.len() != cells.len() {
            return Err(StockError::WeightCoverage(
                "weight map covers cells outside the registered set",
            ));
        }
        Ok(())
    }

    /// Normalized shares in deterministic order: descending weight, cell id
    /// as tiebreak. A non-finite or non-positive weight sum is fatal.
    pub fn normalized(&self) -> Result<Vec<(CellId, f64)>, StockError> {
        let mut entries: Vec<(CellId, f64)> = self
            .weights
            .iter()
            .map(|(cell, weight)| (cell, *weight))
            .collect();
        if entries.is_empty() {
            return Err(StockError::InvalidConfig("weight map is empty"));
        }
        let sum: f64 = entries.iter().map(|(_, weight)| weight).sum();
        if !sum.is_finite() || sum <= 0.0 {
            return Err(StockError::InvalidConfig(
                "weights must normalize to a positive finite sum",
            ));
        }
        entries.sort_by(|a, b| {
            OrderedFloat(b.1)
                .cmp(&OrderedFloat(a.1))
                .then_with(|| a.0.cmp(&b.0))
        });
        Ok(entries
            .into_iter()
            .map(|(cell, weight)| (cell, weight / sum))
            .collect())
    }
}

/// What happens to survivors that would age past the last bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalBinPolicy {
    /// Survivors leaving the last bin are discarded: 100% mortality at max age.
    Dies,
    /// Incoming survivors accumulate on top of the last bin's own survivors.
    PreserveLastAge,
}

/// Applies exponential natural mortality in place:
/// `survivors = count * exp(-rate)` per subdivision and bin.
pub fn apply_natural_mortality(matrix: &mut Abundance, meristics: &Meristics) {
    for subdivision in 0..matrix.subdivisions() {
        for bin in 0..matrix.bins() {
            let rate = meristics.mortality(subdivision, bin);
            if rate > 0.0 {
                let survivors = matrix.get(subdivision, bin) * (-rate).exp();
                matrix.set(subdivision, bin, survivors);
            }
        }
    }
}

/// Shifts every cohort up one bin, vacating bin 0 for recruitment.
///
/// With `remainders` supplied, each shifted entry is truncated to a whole
/// count and the fractional part is carried forward per bin, added back in
/// before the next truncation. The carry matrix must share dimensions with
/// `matrix` and must persist across ticks to do its job.
pub fn age_cohorts(
    matrix: &mut Abundance,
    policy: TerminalBinPolicy,
    remainders: Option<&mut Abundance>,
) {
    let bins = matrix.bins();
    for subdivision in 0..matrix.subdivisions() {
        let row = matrix.row_mut(subdivision);
        match policy {
            TerminalBinPolicy::Dies => {
                for bin in (1..bins).rev() {
                    row[bin] = row[bin - 1];
                }
                row[0] = 0.0;
            }
            TerminalBinPolicy::PreserveLastAge => {
                // A single preserved bin is a steady state; recruits stack on it.
                if bins > 1 {
                    let last = bins - 1;
                    row[last] += row[last - 1];
                    for bin in (1..last).rev() {
                        row[bin] = row[bin - 1];
                    }
                    row[0] = 0.0;
                }
            }
        }
    }
    if let Some(carry) = remainders {
        debug_assert_eq!(carry.subdivisions(), matrix.subdivisions());
        debug_assert_eq!(carry.bins(), bins);
        for subdivision in 0..matrix.subdivisions() {
            for bin in 0..bins {
                let exact = matrix.get(subdivision, bin) + carry.get(subdivision, bin);
                let whole = exact.floor();
                carry.set(subdivision, bin, exact - whole);
                matrix.set(subdivision, bin, whole);
            }
        }
    }
}

/// Optional multiplicative noise drawn per recruitment event.
pub type RecruitmentNoise = Box<dyn FnMut(&mut SmallRng) -> f64 + Send>;

/// Turns an aggregate abundance into this period's recruit count.
pub trait RecruitmentRule: Send {
    /// Number of recruits to inject at bin 0 this accounting period.
    fn recruits(&mut self, species: &Species, total: &Abundance, rng: &mut SmallRng) -> f64;
}

/// Beverton-Holt spawning-biomass recruitment.
///
/// `R = (1 + e) * (4 h R0 SSB) / (R0 phi0 (1 - h) + (5h - 1) SSB)` where `e`
/// is drawn from the optional noise hook.
pub struct BevertonHoltRecruitment {
    virgin_recruits: f64,
    steepness: f64,
    cumulative_phi: f64,
    noise: Option<RecruitmentNoise>,
}

impl fmt::Debug for BevertonHoltRecruitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BevertonHoltRecruitment")
            .field("virgin_recruits", &self.virgin_recruits)
            .field("steepness", &self.steepness)
            .field("cumulative_phi", &self.cumulative_phi)
            .field("noisy", &self.noise.is_some())
            .finish()
    }
}

impl BevertonHoltRecruitment {
    pub fn new(
        virgin_recruits: f64,
        steepness: f64,
        cumulative_phi: f64,
    ) -> Result<Self, StockError> {
        if !(virgin_recruits > 0.0 && virgin_recruits.is_finite()) {
            return Err(StockError::InvalidConfig(
                "virgin recruits must be positive",
            ));
        }
        if !(steepness > 0.0 && steepness.is_finite()) {
            return Err(StockError::InvalidConfig("steepness must be positive"));
        }
        if !(cumulative_phi > 0.0 && cumulative_phi.is_finite()) {
            return Err(StockError::InvalidConfig(
                "cumulative reproductive potential must be positive",
            ));
        }
        Ok(Self {
            virgin_recruits,
            steepness,
            cumulative_phi,
            noise: None,
        })
    }

    /// Attaches a multiplicative noise hook.
    #[must_use]
    pub fn with_noise(mut self, noise: RecruitmentNoise) -> Self {
        self.noise = Some(noise);
        self
    }

    fn recruits_from_ssb(&mut self, ssb: f64, rng: &mut SmallRng) -> f64 {
        if !(ssb > 0.0) || !ssb.is_finite() {
            return 0.0;
        }
        let noise = self.noise.as_mut().map_or(0.0, |draw| draw(rng));
        let numerator = 4.0 * self.steepness * self.virgin_recruits * ssb;
        let denominator = self.virgin_recruits * self.cumulative_phi * (1.0 - self.steepness)
            + (5.0 * self.steepness - 1.0) * ssb;
        ((1.0 + noise) * numerator / denominator).max(0.0)
    }
}

impl RecruitmentRule for BevertonHoltRecruitment {
    fn recruits(&mut self, species: &Species, total: &Abundance, rng: &mut SmallRng) -> f64 {
        let ssb = species.spawning_biomass(total);
        self.recruits_from_ssb(ssb, rng)
    }
}

/// Beverton-Holt evaluated on spawning biomass from `lag` periods ago.
///
/// The rolling buffer starts filled with the assumed-virgin spawning biomass,
/// so early periods recruit as if the stock were unfished.
#[derive(Debug)]
pub struct DelayedRecruitment {
    base: BevertonHoltRecruitment,
    history: VecDeque<f64>,
}

impl DelayedRecruitment {
    pub fn new(
        base: BevertonHoltRecruitment,
        lag: usize,
        virgin_ssb: f64,
    ) -> Result<Self, StockError> {
        if lag == 0 {
            return Err(StockError::InvalidConfig(
                "recruitment lag must be at least one period",
            ));
        }
        if !(virgin_ssb > 0.0 && virgin_ssb.is_finite()) {
            return Err(StockError::InvalidConfig(
                "virgin spawning biomass must be positive",
            ));
        }
        Ok(Self {
            base,
            history: std::iter::repeat(virgin_ssb).take(lag).collect(),
        })
    }
}

impl RecruitmentRule for DelayedRecruitment {
    fn recruits(&mut self, species: &Species, total: &Abundance, rng: &mut SmallRng) -> f64 {
        let current = species.spawning_biomass(total);
        self.history.push_back(current);
        let lagged = self.history.pop_front().unwrap_or(current);
        self.base.recruits_from_ssb(lagged, rng)
    }
}

/// Piecewise-linear recruitment: linear in SSB below the hinge, saturated at
/// the virgin recruit count above it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HockeyStickRecruitment {
    virgin_recruits: f64,
    hinge: f64,
    virgin_ssb: f64,
}

impl HockeyStickRecruitment {
    pub fn new(virgin_recruits: f64, hinge: f64, virgin_ssb: f64) -> Result<Self, StockError> {
        if !(virgin_recruits > 0.0 && virgin_recruits.is_finite()) {
            return Err(StockError::InvalidConfig(
                "virgin recruits must be positive",
            ));
        }
        if !(hinge > 0.0 && hinge <= 1.0) {
            return Err(StockError::InvalidConfig("hinge must lie in (0, 1]"));
        }
        if !(virgin_ssb > 0.0 && virgin_ssb.is_finite()) {
            return Err(StockError::InvalidConfig(
                "virgin spawning biomass must be positive",
            ));
        }
        Ok(Self {
            virgin_recruits,
            hinge,
            virgin_ssb,
        })
    }
}

impl RecruitmentRule for HockeyStickRecruitment {
    fn recruits(&mut self, species: &Species, total: &Abundance, _rng: &mut SmallRng) -> f64 {
        let ssb = species.spawning_biomass(total);
        if !(ssb > 0.0) || !ssb.is_finite() {
            return 0.0;
        }
        let knee = self.hinge * self.virgin_ssb;
        if ssb < knee {
            self.virgin_recruits * ssb / knee
        } else {
            self.virgin_recruits
        }
    }
}

/// Biomass-proportional shares over a fixed cell set, falling back to uniform
/// when every cell is empty so a recruit cohort is never dropped.
fn biomass_shares(
    arena: &CellArena,
    cells: &[CellId],
    index: usize,
    species: &Species,
) -> Result<Vec<(CellId, f64)>, StockError> {
    if cells.is_empty() {
        return Err(StockError::InvalidConfig(
            "natural process tracks no cells",
        ));
    }
    let mut map = WeightMap::new();
    let mut any_stock = false;
    for &cell in cells {
        let biomass = arena
            .get(cell)
            .map_or(0.0, |stock| stock.biomass_of(index, species));
        if biomass > 0.0 {
            any_stock = true;
        }
        map.insert(cell, biomass);
    }
    if !any_stock {
        for &cell in cells {
            map.insert(cell, 1.0);
        }
    }
    map.normalized()
}

/// Yearly demographic pipeline for one abundance-governed species: aggregate,
/// recruit, cull, age, inject.
pub struct NaturalProcess {
    species: usize,
    cells: Vec<CellId>,
    recruitment: Box<dyn RecruitmentRule>,
    terminal_bin: TerminalBinPolicy,
    rounding: bool,
    remainders: CellMap<Abundance>,
    recruit_allocator: Option<WeightMap>,
    last_recruits: f64,
}

impl fmt::Debug for NaturalProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NaturalProcess")
            .field("species", &self.species)
            .field("cells", &self.cells.len())
            .field("terminal_bin", &self.terminal_bin)
            .field("rounding", &self.rounding)
            .field("last_recruits", &self.last_recruits)
            .finish()
    }
}

impl NaturalProcess {
    pub fn new(
        species: usize,
        recruitment: Box<dyn RecruitmentRule>,
        terminal_bin: TerminalBinPolicy,
        rounding: bool,
    ) -> Self {
        Self {
            species,
            cells: Vec::new(),
            recruitment,
            terminal_bin,
            rounding,
            remainders: CellMap::new(),
            recruit_allocator: None,
            last_recruits: 0.0,
        }
    }

    /// Forces recruits to land according to a fixed weight map instead of
    /// following current biomass.
    #[must_use]
    pub fn with_recruit_allocator(mut self, allocator: WeightMap) -> Self {
        self.recruit_allocator = Some(allocator);
        self
    }

    /// Adds a cell to the managed set. Registering the same cell twice is a
    /// precondition failure.
    pub fn track_cell(&mut self, cell: CellId) -> Result<(), StockError> {
        if self.cells.contains(&cell) {
            return Err(StockError::DuplicateCell);
        }
        self.cells.push(cell);
        Ok(())
    }

    #[must_use]
    pub const fn species_index(&self) -> usize {
        self.species
    }

    #[must_use]
    pub fn cells(&self) -> &[CellId] {
        &self.cells
    }

    /// Recruits computed by the most recent yearly step.
    #[must_use]
    pub const fn last_recruits(&self) -> f64 {
        self.last_recruits
    }

    /// Runs one accounting year over the managed cells.
    pub fn step_year(
        &mut self,
        arena: &mut CellArena,
        registry: &SpeciesRegistry,
        rng: &mut SmallRng,
    ) -> Result<(), StockError> {
        let species = registry
            .get(self.species)
            .ok_or(StockError::UnknownSpecies(self.species))?;
        let meristics = species.meristics();

        let mut total = Abundance::zeros(meristics.subdivisions(), meristics.bins());
        for &cell in &self.cells {
            if let Some(matrix) = arena.get(cell).and_then(|stock| stock.abundance(self.species)) {
                total.accumulate(matrix);
            }
        }

        let recruits = self.recruitment.recruits(species, &total, rng);
        self.last_recruits = recruits;

        // Shares are derived before mortality so recruits follow the biomass
        // distribution the spawners actually had.
        let shares = match &self.recruit_allocator {
            Some(allocator) => {
                allocator.validate_coverage(&self.cells)?;
                allocator.normalized()?
            }
            None => biomass_shares(arena, &self.cells, self.species, species)?,
        };

        for &cell in &self.cells {
            if self.rounding && !self.remainders.contains_key(cell) {
                self.remainders.insert(
                    cell,
                    Abundance::zeros(meristics.subdivisions(), meristics.bins()),
                );
            }
            let Some(stock) = arena.get_mut(cell) else {
                continue;
            };
            let Some(matrix) = stock.abundance_mut(self.species) else {
                continue;
            };
            apply_natural_mortality(matrix, meristics);
            let remainder = if self.rounding {
                self.remainders.get_mut(cell)
            } else {
                None
            };
            age_cohorts(matrix, self.terminal_bin, remainder);
        }

        if recruits > 0.0 {
            let mut leftover = 0.0;
            for &(cell, share) in &shares {
                let mut here = recruits * share + leftover;
                leftover = 0.0;
                if self.rounding {
                    let whole = here.floor();
                    leftover = here - whole;
                    here = whole;
                }
                if here <= 0.0 {
                    continue;
                }
                if let Some(matrix) = arena
                    .get_mut(cell)
                    .and_then(|stock| stock.abundance_mut(self.species))
                {
                    let per_subdivision = here / matrix.subdivisions() as f64;
                    for subdivision in 0..matrix.subdivisions() {
                        matrix.add(subdivision, 0, per_subdivision);
                    }
                }
            }
        }

        Ok(())
    }
}

/// Daily movement model for biomass-governed species.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BiomassMovement {
    /// Moves a bounded share of the biomass differential between neighbors.
    Differential { fraction: f64, daily_limit: f64 },
    /// Moves each cell toward its capacity share of an external target series.
    Smoothed {
        rate: f64,
        targets: Vec<f64>,
        cursor: usize,
    },
}

impl BiomassMovement {
    pub fn differential(fraction: f64, daily_limit: f64) -> Result<Self, StockError> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(StockError::InvalidConfig(
                "differential fraction must lie in [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&daily_limit) {
            return Err(StockError::InvalidConfig(
                "daily movement limit must lie in [0, 1]",
            ));
        }
        Ok(Self::Differential {
            fraction,
            daily_limit,
        })
    }

    pub fn smoothed(rate: f64, targets: Vec<f64>) -> Result<Self, StockError> {
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(StockError::InvalidConfig(
                "smoothing rate must lie in (0, 1]",
            ));
        }
        if targets.is_empty() || targets.iter().any(|target| !target.is_finite()) {
            return Err(StockError::InvalidConfig(
                "target series must be non-empty and finite",
            ));
        }
        Ok(Self::Smoothed {
            rate,
            targets,
            cursor: 0,
        })
    }

    /// Applies one movement tick for `index` over the arena.
    pub fn step(&mut self, arena: &mut CellArena, index: usize) {
        match self {
            Self::Differential {
                fraction,
                daily_limit,
            } => step_differential(arena, index, *fraction, *daily_limit),
            Self::Smoothed {
                rate,
                targets,
                cursor,
            } => {
                let target_total = targets[(*cursor).min(targets.len() - 1)];
                *cursor = (*cursor + 1).min(targets.len() - 1);
                step_smoothed(arena, index, *rate, target_total);
            }
        }
    }
}

/// One pass of bounded differential diffusion. Pairs are visited in
/// registration order against live values, so a donor can never be drained
/// below zero by successive neighbors; every unit leaving one cell lands in
/// the other, keeping the pass conservative.
fn step_differential(arena: &mut CellArena, index: usize, fraction: f64, daily_limit: f64) {
    for pair_idx in 0..arena.pairs().len() {
        let (a, b) = arena.pairs()[pair_idx];
        let Some(LocalStock::Biomass(stock_a)) = arena.get(a) else {
            continue;
        };
        let Some(LocalStock::Biomass(stock_b)) = arena.get(b) else {
            continue;
        };
        let here = stock_a.biomass(index);
        let there = stock_b.biomass(index);
        let differential = here - there;
        if differential.abs() <= f64::EPSILON {
            continue;
        }
        let (donor, recipient, donor_biomass, recipient_biomass, recipient_capacity) =
            if differential > 0.0 {
                (a, b, here, there, stock_b.capacity(index))
            } else {
                (b, a, there, here, stock_a.capacity(index))
            };
        let moved = (fraction * differential.abs() / 2.0)
            .min(daily_limit * donor_biomass)
            .min((recipient_capacity - recipient_biomass).max(0.0));
        if moved <= 0.0 {
            continue;
        }
        if let Some(LocalStock::Biomass(stock)) = arena.get_mut(donor) {
            stock.add_biomass(index, -moved);
        }
        if let Some(LocalStock::Biomass(stock)) = arena.get_mut(recipient) {
            stock.add_biomass(index, moved);
        }
    }
}

/// One pass of the smoothed movement rule: each cell steps toward its
/// capacity share of the external target total, ignoring neighbors.
fn step_smoothed(arena: &mut CellArena, index: usize, rate: f64, target_total: f64) {
    let mut total_capacity = 0.0;
    for (_, stock) in arena.iter() {
        if let LocalStock::Biomass(stock) = stock {
            total_capacity += stock.capacity(index);
        }
    }
    if !(total_capacity > 0.0) {
        return;
    }
    let ids: Vec<CellId> = arena.ids().collect();
    for id in ids {
        if let Some(LocalStock::Biomass(stock)) = arena.get_mut(id) {
            let share = stock.capacity(index) / total_capacity;
            let target = target_total * share;
            let biomass = stock.biomass(index);
            stock.set_biomass(index, biomass + rate * (target - biomass));
        }
    }
}

/// Neighbor-to-neighbor diffusion for structured abundance. Off by default
/// for age-structured species; register it explicitly to enable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AbundanceDiffuser {
    rate: f64,
}

impl AbundanceDiffuser {
    /// `rate` is the fraction of the per-bin count differential moved per
    /// pair per tick; 0.5 fully equalizes a pair in one pass.
    pub fn new(rate: f64) -> Result<Self, StockError> {
        if !(0.0..=0.5).contains(&rate) {
            return Err(StockError::InvalidConfig(
                "abundance diffusion rate must lie in [0, 0.5]",
            ));
        }
        Ok(Self { rate })
    }

    /// Applies one diffusion tick for `index` over every adjacent pair.
    pub fn step(&self, arena: &mut CellArena, index: usize) {
        if self.rate == 0.0 {
            return;
        }
        for pair_idx in 0..arena.pairs().len() {
            let (a, b) = arena.pairs()[pair_idx];
            let mut moves: Vec<(usize, usize, f64)> = Vec::new();
            {
                let Some(here) = arena.get(a).and_then(|stock| stock.abundance(index)) else {
                    continue;
                };
                let Some(there) = arena.get(b).and_then(|stock| stock.abundance(index)) else {
                    continue;
                };
                for subdivision in 0..here.subdivisions() {
                    for bin in 0..here.bins() {
                        let moved =
                            self.rate * (here.get(subdivision, bin) - there.get(subdivision, bin));
                        if moved != 0.0 {
                            moves.push((subdivision, bin, moved));
                        }
                    }
                }
            }
            if moves.is_empty() {
                continue;
            }
            if let Some(matrix) = arena.get_mut(a).and_then(|stock| stock.abundance_mut(index)) {
                for &(subdivision, bin, moved) in &moves {
                    matrix.add(subdivision, bin, -moved);
                }
            }
            if let Some(matrix) = arena.get_mut(b).and_then(|stock| stock.abundance_mut(index)) {
                for &(subdivision, bin, moved) in &moves {
                    matrix.add(subdivision, bin, moved);
                }
            }
        }
    }
}

/// Redistributes an aggregate stock across cells by normalized habitat
/// weights. The shares are captured once at construction, so applying the
/// same aggregate twice is idempotent; that snapshot is also the pristine
/// distribution used for resets.
#[derive(Debug, Clone)]
pub struct Reallocator {
    species: usize,
    shares: Vec<(CellId, f64)>,
}

impl Reallocator {
    /// Validates coverage against the registered cell set and normalizes.
    pub fn new(species: usize, weights: &WeightMap, cells: &[CellId]) -> Result<Self, StockError> {
        weights.validate_coverage(cells)?;
        let shares = weights.normalized()?;
        Ok(Self { species, shares })
    }

    #[must_use]
    pub const fn species_index(&self) -> usize {
        self.species
    }

    /// Normalized per-cell shares in deterministic order.
    #[must_use]
    pub fn shares(&self) -> &[(CellId, f64)] {
        &self.shares
    }

    /// Writes `total * share` into every covered biomass cell, clamped to
    /// each cell's capacity. Returns the total clamped away, for the caller
    /// to log.
    pub fn apply_biomass(&self, arena: &mut CellArena, total: f64) -> f64 {
        let mut clamped = 0.0;
        for &(cell, share) in &self.shares {
            if let Some(LocalStock::Biomass(stock)) = arena.get_mut(cell) {
                let target = total * share;
                let stored = stock.set_biomass(self.species, target);
                clamped += target - stored;
            }
        }
        clamped
    }

    /// Replaces every covered abundance matrix with `total * share`. This is
    /// the setup-time path for laying an aggregate count matrix over the
    /// arena; runtime yearly reallocation goes through [`Self::apply_biomass`].
    pub fn apply_abundance(&self, arena: &mut CellArena, total: &Abundance) {
        for &(cell, share) in &self.shares {
            if let Some(matrix) = arena
                .get_mut(cell)
                .and_then(|stock| stock.abundance_mut(self.species))
            {
                *matrix = total.scaled(share);
            }
        }
    }

    /// Re-derives the original distribution from a (possibly updated) total.
    pub fn reset_to_pristine(&self, arena: &mut CellArena, total: f64) -> f64 {
        self.apply_biomass(arena, total)
    }
}

/// Capacity-bounded logistic growth applied to each cell independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticGrower {
    species: usize,
    malthusian: f64,
    cells: Vec<CellId>,
}

impl LogisticGrower {
    pub fn new(species: usize, malthusian: f64) -> Result<Self, StockError> {
        if !(malthusian >= 0.0 && malthusian.is_finite()) {
            return Err(StockError::InvalidConfig(
                "malthusian parameter must be non-negative",
            ));
        }
        Ok(Self {
            species,
            malthusian,
            cells: Vec::new(),
        })
    }

    pub fn track_cell(&mut self, cell: CellId) -> Result<(), StockError> {
        if self.cells.contains(&cell) {
            return Err(StockError::DuplicateCell);
        }
        self.cells.push(cell);
        Ok(())
    }

    #[must_use]
    pub const fn species_index(&self) -> usize {
        self.species
    }

    /// One year of logistic growth: `b += m (1 - b/K) b`, clamped to `K`.
    pub fn step_year(&mut self, arena: &mut CellArena) {
        for &cell in &self.cells {
            if let Some(LocalStock::Biomass(stock)) = arena.get_mut(cell) {
                let capacity = stock.capacity(self.species);
                if capacity <= 0.0 {
                    continue;
                }
                let biomass = stock.biomass(self.species);
                let grown = biomass + self.malthusian * (1.0 - biomass / capacity) * biomass;
                stock.set_biomass(self.species, grown.min(capacity));
            }
        }
    }
}

/// Result of one delay-difference projection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayDifferenceStep {
    pub biomass: f64,
    pub recruits: f64,
}

/// Deriso-Schnute delay-difference projection.
///
/// `previous` holds the last `lag` end-of-period totals (back = newest) and
/// `survival` the last two realized survival rates; both queues are rotated
/// in place. The caller inserts the returned biomass into the model.
///
/// `previous` must hold at least two entries and `survival` exactly two;
/// the queue seeding in [`DerisoSchnuteGrower::new`] guarantees this.
#[allow(clippy::too_many_arguments)]
pub fn delay_difference_step(
    current_biomass: f64,
    virgin_biomass: f64,
    previous: &mut VecDeque<f64>,
    survival: &mut VecDeque<f64>,
    natural_survival: f64,
    steepness: f64,
    weight_at_recruitment: f64,
    rho: f64,
    weight_at_recruitment_prev: f64,
    previous_recruits: f64,
) -> DelayDifferenceStep {
    debug_assert!(previous.len() >= 2, "biomass queue must span the lag");
    debug_assert_eq!(survival.len(), 2, "survival queue holds two periods");
    let virgin_recruits = virgin_biomass
        * (1.0 - (1.0 + rho) * natural_survival + rho * natural_survival * natural_survival)
        / (weight_at_recruitment - rho * natural_survival * weight_at_recruitment_prev);
    let alpha = (1.0 - steepness) / (4.0 * steepness * virgin_recruits);
    let beta = (5.0 * steepness - 1.0) / (4.0 * steepness * virgin_recruits);

    // The newest queue entry reflects fishing but not this period's natural
    // mortality, so the equation reaches one slot further back.
    let prior_biomass = previous[previous.len() - 2];
    let newest = previous[previous.len() - 1];
    let realized_survival = current_biomass / newest * natural_survival;
    survival.pop_front();
    survival.push_back(realized_survival);

    let spawners = previous.pop_front().unwrap_or(virgin_biomass);
    let depletion = spawners / virgin_biomass;
    let recruits = depletion / (alpha + beta * depletion);

    let biomass = (1.0 + rho) * current_biomass * natural_survival
        - rho * survival[0] * survival[1] * prior_biomass
        - rho * survival[1] * weight_at_recruitment_prev * previous_recruits
        + weight_at_recruitment * recruits;
    previous.push_back(biomass);

    DelayDifferenceStep { biomass, recruits }
}

/// Spreads a signed biomass delta across candidate cells at random, clamping
/// at capacity (when adding) or zero (when removing) and returning any excess
/// to the pool until it is exhausted or no candidate can absorb more.
pub fn allocate_biomass_at_random(
    arena: &mut CellArena,
    candidates: &mut Vec<CellId>,
    index: usize,
    amount: f64,
    rng: &mut SmallRng,
) {
    let mut pool = amount;
    while pool.abs() > EPSILON && !candidates.is_empty() {
        let pick = rng.random_range(0..candidates.len());
        let id = candidates[pick];
        let slice = pool / candidates.len() as f64;
        let Some(LocalStock::Biomass(stock)) = arena.get_mut(id) else {
            candidates.swap_remove(pick);
            continue;
        };
        let capacity = stock.capacity(index);
        let updated = stock.biomass(index) + slice;
        pool -= slice;
        if updated > capacity {
            pool += updated - capacity;
            stock.set_biomass(index, capacity);
            candidates.swap_remove(pick);
        } else if updated < 0.0 {
            pool += updated;
            stock.set_biomass(index, 0.0);
            candidates.swap_remove(pick);
        } else {
            stock.set_biomass(index, updated);
        }
    }
}

/// Pooled Deriso-Schnute grower: aggregates member cells into one biomass,
/// projects it forward yearly, and scatters the delta back at random.
#[derive(Debug, Clone)]
pub struct DerisoSchnuteGrower {
    species: usize,
    rho: f64,
    natural_survival: f64,
    steepness: f64,
    weight_at_recruitment: f64,
    weight_at_recruitment_prev: f64,
    previous_biomasses: VecDeque<f64>,
    survival_rates: VecDeque<f64>,
    last_recruits: f64,
    cells: Vec<CellId>,
}

impl DerisoSchnuteGrower {
    /// `empirical_biomasses` seeds the delay queue (newest last) and must
    /// cover at least `lag` periods; `empirical_survival`, when given, seeds
    /// the two-slot survival queue, otherwise the natural rate is assumed.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        species: usize,
        rho: f64,
        natural_survival: f64,
        steepness: f64,
        lag: usize,
        weight_at_recruitment: f64,
        weight_at_recruitment_prev: f64,
        empirical_biomasses: &[f64],
        empirical_survival: Option<&[f64]>,
        initial_recruits: f64,
    ) -> Result<Self, StockError> {
        if lag < 2 {
            return Err(StockError::InvalidConfig(
                "recruitment lag must span at least two periods",
            ));
        }
        if !(natural_survival > 0.0 && natural_survival <= 1.0) {
            return Err(StockError::InvalidConfig(
                "natural survival rate must lie in (0, 1]",
            ));
        }
        if !(steepness > 0.0 && steepness.is_finite()) {
            return Err(StockError::InvalidConfig("steepness must be positive"));
        }
        if !(weight_at_recruitment > 0.0) || !(weight_at_recruitment_prev > 0.0) {
            return Err(StockError::InvalidConfig(
                "weights at recruitment must be positive",
            ));
        }
        if empirical_biomasses.len() < lag {
            return Err(StockError::InvalidConfig(
                "empirical biomass series shorter than the recruitment lag",
            ));
        }
        let previous_biomasses: VecDeque<f64> = empirical_biomasses
            [empirical_biomasses.len() - lag..]
            .iter()
            .copied()
            .collect();
        let survival_rates: VecDeque<f64> = match empirical_survival {
            Some(series) => {
                if series.len() < 2 {
                    return Err(StockError::InvalidConfig(
                        "empirical survival series needs at least two periods",
                    ));
                }
                series[series.len() - 2..].iter().copied().collect()
            }
            None => std::iter::repeat(natural_survival).take(2).collect(),
        };
        Ok(Self {
            species,
            rho,
            natural_survival,
            steepness,
            weight_at_recruitment,
            weight_at_recruitment_prev,
            previous_biomasses,
            survival_rates,
            last_recruits: initial_recruits,
            cells: Vec::new(),
        })
    }

    pub fn track_cell(&mut self, cell: CellId) -> Result<(), StockError> {
        if self.cells.contains(&cell) {
            return Err(StockError::DuplicateCell);
        }
        self.cells.push(cell);
        Ok(())
    }

    #[must_use]
    pub const fn species_index(&self) -> usize {
        self.species
    }

    /// Recruits computed by the most recent yearly step.
    #[must_use]
    pub const fn last_recruits(&self) -> f64 {
        self.last_recruits
    }

    /// One yearly delay-difference step over the pooled member cells.
    pub fn step_year(&mut self, arena: &mut CellArena, rng: &mut SmallRng) {
        let mut current = 0.0;
        let mut virgin = 0.0;
        for &cell in &self.cells {
            if let Some(LocalStock::Biomass(stock)) = arena.get(cell) {
                current += stock.biomass(self.species);
                virgin += stock.capacity(self.species);
            }
        }
        if !(virgin > 0.0) {
            return;
        }
        let step = delay_difference_step(
            current,
            virgin,
            &mut self.previous_biomasses,
            &mut self.survival_rates,
            self.natural_survival,
            self.steepness,
            self.weight_at_recruitment,
            self.rho,
            self.weight_at_recruitment_prev,
            self.last_recruits,
        );
        self.last_recruits = step.recruits;

        let delta = step.biomass - current;
        if delta.abs() < EPSILON {
            return;
        }
        let mut candidates: Vec<CellId> = self
            .cells
            .iter()
            .copied()
            .filter(|&cell| match arena.get(cell) {
                Some(LocalStock::Biomass(stock)) => {
                    if delta > 0.0 {
                        stock.biomass(self.species) < stock.capacity(self.species)
                    } else {
                        stock.biomass(self.species) > 0.0
                    }
                }
                _ => false,
            })
            .collect();
        allocate_biomass_at_random(arena, &mut candidates, self.species, delta, rng);
    }
}

/// Per-tick stock summary retained in history and handed to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct StockSummary {
    pub tick: Tick,
    pub year: u64,
    pub habitable_cells: usize,
    /// Total biomass per species, indexed like the registry.
    pub total_biomass: Vec<f64>,
    /// Recruits computed by the latest yearly step, per species.
    pub last_recruits: Vec<f64>,
}

/// Named scalar sampled for an external data-collection facility.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSample {
    pub name: Cow<'static, str>,
    pub value: f64,
}

impl SeriesSample {
    #[must_use]
    pub fn new(name: impl Into<Cow<'static, str>>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Aggregate payload forwarded to observers after a tick completes.
#[derive(Debug, Clone)]
pub struct ObservationBatch {
    pub summary: StockSummary,
    pub series: Vec<SeriesSample>,
}

/// Observation sink invoked at the configured interval.
pub trait StockObserver: Send {
    fn on_tick(&mut self, batch: &ObservationBatch);
}

/// No-op observation sink.
#[derive(Debug, Default)]
pub struct NullObserver;

impl StockObserver for NullObserver {
    fn on_tick(&mut self, _batch: &ObservationBatch) {}
}

/// Events emitted by one world step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickEvents {
    pub tick: Tick,
    pub year_rolled: bool,
    pub observed: bool,
}

/// One-shot warning latches so numeric clamps do not flood the log.
#[derive(Debug, Default, Clone)]
struct ClampWarnings {
    over_capacity: bool,
    bad_weight: bool,
}

impl ClampWarnings {
    fn over_capacity(&mut self, lost: f64) {
        if !self.over_capacity {
            self.over_capacity = true;
            warn!(
                lost,
                "allocated biomass exceeded carrying capacity and was clamped; further occurrences suppressed"
            );
        }
    }

    fn bad_weight(&mut self) {
        if !self.bad_weight {
            self.bad_weight = true;
            warn!(
                "non-finite or negative habitat weight treated as wasteland; further occurrences suppressed"
            );
        }
    }
}

/// A process registered with the world scheduler.
enum ProcessSlot {
    Natural(NaturalProcess),
    BiomassMovement {
        species: usize,
        rule: BiomassMovement,
    },
    AbundanceMovement {
        species: usize,
        rule: AbundanceDiffuser,
    },
    Logistic(LogisticGrower),
    DelayDifference(DerisoSchnuteGrower),
    Reallocation(Reallocator),
}

/// The stock world: species registry, cell arena, registered processes, and
/// the seeded RNG every stochastic call draws from.
///
/// Each tick is one simulated day. Movement runs daily; natural processes,
/// growers, and runtime reallocation run when the tick closes a year.
pub struct StockWorld {
    config: StockConfig,
    registry: SpeciesRegistry,
    tick: Tick,
    rng: SmallRng,
    arena: CellArena,
    tasks: SlotMap<TaskId, ProcessSlot>,
    order: Vec<TaskId>,
    governed: Vec<bool>,
    observer: Box<dyn StockObserver>,
    history: VecDeque<StockSummary>,
    warnings: ClampWarnings,
}

impl fmt::Debug for StockWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StockWorld")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("cells", &self.arena.len())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl StockWorld {
    /// Builds a world with the default (no-op) observer.
    pub fn new(config: StockConfig, registry: SpeciesRegistry) -> Result<Self, StockError> {
        Self::with_observer(config, registry, Box::new(NullObserver))
    }

    /// Builds a world delivering observation batches to `observer`.
    pub fn with_observer(
        config: StockConfig,
        registry: SpeciesRegistry,
        observer: Box<dyn StockObserver>,
    ) -> Result<Self, StockError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let history_capacity = config.history_capacity;
        let governed = vec![false; registry.len()];
        Ok(Self {
            config,
            registry,
            tick: Tick::zero(),
            rng,
            arena: CellArena::new(),
            tasks: SlotMap::with_key(),
            order: Vec::new(),
            governed,
            observer,
            history: VecDeque::with_capacity(history_capacity),
            warnings: ClampWarnings::default(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &StockConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &SpeciesRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Completed simulation years.
    #[must_use]
    pub fn year(&self) -> u64 {
        self.tick.0 / u64::from(self.config.days_per_year)
    }

    #[must_use]
    pub fn arena(&self) -> &CellArena {
        &self.arena
    }

    #[must_use]
    pub fn arena_mut(&mut self) -> &mut CellArena {
        &mut self.arena
    }

    /// Borrow the world RNG mutably for deterministic sampling.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Replace the observation sink.
    pub fn set_observer(&mut self, observer: Box<dyn StockObserver>) {
        self.observer = observer;
    }

    /// Iterate over retained stock summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &StockSummary> {
        self.history.iter()
    }

    /// Adds a biomass-governed cell sized for the registry.
    pub fn add_biomass_cell(&mut self) -> CellId {
        self.arena
            .insert(LocalStock::Biomass(BiomassStock::new(self.registry.len())))
    }

    /// Adds an abundance-governed cell sized from each species' meristics.
    pub fn add_abundance_cell(&mut self) -> CellId {
        self.arena
            .insert(LocalStock::Abundance(AbundanceStock::new(&self.registry)))
    }

    /// Adds a land cell that no process will touch.
    pub fn add_land_cell(&mut self) -> CellId {
        self.arena.insert(LocalStock::Empty)
    }

    /// Adds a fixed-stock cell that reads like biomass but is never mutated.
    pub fn add_constant_cell(&mut self, stock: BiomassStock) -> CellId {
        self.arena.insert(LocalStock::Constant(stock))
    }

    /// Declares two cells adjacent for movement.
    pub fn connect(&mut self, a: CellId, b: CellId) {
        self.arena.connect(a, b);
    }

    fn check_species(&self, species: usize) -> Result<(), StockError> {
        if species >= self.registry.len() {
            return Err(StockError::UnknownSpecies(species));
        }
        Ok(())
    }

    fn claim_governance(&mut self, species: usize) -> Result<(), StockError> {
        self.check_species(species)?;
        if self.governed[species] {
            return Err(StockError::InvalidConfig(
                "species is already governed by a growth process",
            ));
        }
        self.governed[species] = true;
        Ok(())
    }

    fn push_task(&mut self, slot: ProcessSlot) -> TaskId {
        let id = self.tasks.insert(slot);
        self.order.push(id);
        id
    }

    /// Registers the yearly demographic pipeline for a species. A species is
    /// governed by exactly one growth mechanism at a time.
    pub fn register_natural_process(
        &mut self,
        process: NaturalProcess,
    ) -> Result<TaskId, StockError> {
        self.claim_governance(process.species_index())?;
        Ok(self.push_task(ProcessSlot::Natural(process)))
    }

    /// Registers a daily biomass movement rule for a species.
    pub fn register_biomass_movement(
        &mut self,
        species: usize,
        rule: BiomassMovement,
    ) -> Result<TaskId, StockError> {
        self.check_species(species)?;
        Ok(self.push_task(ProcessSlot::BiomassMovement { species, rule }))
    }

    /// Registers a daily abundance diffuser for a species.
    pub fn register_abundance_movement(
        &mut self,
        species: usize,
        rule: AbundanceDiffuser,
    ) -> Result<TaskId, StockError> {
        self.check_species(species)?;
        Ok(self.push_task(ProcessSlot::AbundanceMovement { species, rule }))
    }

    /// Registers a yearly logistic grower.
    pub fn register_logistic_grower(
        &mut self,
        grower: LogisticGrower,
    ) -> Result<TaskId, StockError> {
        self.claim_governance(grower.species_index())?;
        Ok(self.push_task(ProcessSlot::Logistic(grower)))
    }

    /// Registers a yearly pooled Deriso-Schnute grower.
    pub fn register_delay_difference_grower(
        &mut self,
        grower: DerisoSchnuteGrower,
    ) -> Result<TaskId, StockError> {
        self.claim_governance(grower.species_index())?;
        Ok(self.push_task(ProcessSlot::DelayDifference(grower)))
    }

    /// Registers a yearly redistribution of the species' current total along
    /// the reallocator's pristine shares.
    pub fn register_reallocation(&mut self, realloc: Reallocator) -> Result<TaskId, StockError> {
        self.check_species(realloc.species_index())?;
        Ok(self.push_task(ProcessSlot::Reallocation(realloc)))
    }

    /// Cancels a registered process. The process performs no further
    /// mutation; growth governance for its species is released.
    pub fn cancel(&mut self, task: TaskId) -> bool {
        let Some(slot) = self.tasks.remove(task) else {
            return false;
        };
        let released = match slot {
            ProcessSlot::Natural(process) => Some(process.species_index()),
            ProcessSlot::Logistic(grower) => Some(grower.species_index()),
            ProcessSlot::DelayDifference(grower) => Some(grower.species_index()),
            _ => None,
        };
        if let Some(species) = released {
            if let Some(flag) = self.governed.get_mut(species) {
                *flag = false;
            }
        }
        self.order.retain(|id| *id != task);
        debug!(?task, "process cancelled");
        true
    }

    /// Read access to a registered natural process, e.g. for recruit counts.
    #[must_use]
    pub fn natural_process(&self, task: TaskId) -> Option<&NaturalProcess> {
        match self.tasks.get(task) {
            Some(ProcessSlot::Natural(process)) => Some(process),
            _ => None,
        }
    }

    /// Seeds one biomass species over the arena in two passes: habitat
    /// weights first (non-finite or non-positive weights turn cells to
    /// wasteland), then capacity and initial biomass proportional to the
    /// normalized shares. Returns the reallocator holding the pristine
    /// distribution.
    pub fn seed_biomass<F>(
        &mut self,
        species: usize,
        total_capacity: f64,
        total_initial: f64,
        mut habitat: F,
    ) -> Result<Reallocator, StockError>
    where
        F: FnMut(CellId, &mut SmallRng) -> f64,
    {
        self.check_species(species)?;
        if !(total_capacity > 0.0 && total_capacity.is_finite()) {
            return Err(StockError::InvalidConfig(
                "total carrying capacity must be positive",
            ));
        }
        if !(total_initial >= 0.0 && total_initial.is_finite()) {
            return Err(StockError::InvalidConfig(
                "total initial biomass must be non-negative",
            ));
        }

        let ids: Vec<CellId> = self.arena.ids().collect();
        let mut weights = WeightMap::new();
        let mut habitable = Vec::new();
        for id in ids {
            if !self
                .arena
                .get(id)
                .is_some_and(|stock| matches!(stock, LocalStock::Biomass(_)))
            {
                continue;
            }
            let weight = habitat(id, &mut self.rng);
            if !weight.is_finite() || weight <= 0.0 {
                if !weight.is_finite() || weight < 0.0 {
                    self.warnings.bad_weight();
                }
                if let Some(stock) = self.arena.get_mut(id) {
                    stock.make_wasteland();
                }
                continue;
            }
            weights.insert(id, weight);
            habitable.push(id);
        }
        if habitable.is_empty() {
            return Err(StockError::InvalidConfig(
                "habitat weights left no habitable cells",
            ));
        }

        let realloc = Reallocator::new(species, &weights, &habitable)?;
        for &(cell, share) in realloc.shares() {
            if let Some(LocalStock::Biomass(stock)) = self.arena.get_mut(cell) {
                stock.set_capacity(species, total_capacity * share);
            }
        }
        let clamped = realloc.apply_biomass(&mut self.arena, total_initial);
        if clamped > EPSILON {
            self.warnings.over_capacity(clamped);
        }
        Ok(realloc)
    }

    /// Converts habitable cells holding no stock for any species into
    /// permanent wasteland. Call once after all species are seeded.
    pub fn retire_barren_cells(&mut self) -> usize {
        let ids: Vec<CellId> = self.arena.ids().collect();
        let mut retired = 0;
        for id in ids {
            let barren = match self.arena.get(id) {
                Some(stock) if stock.is_habitable() => {
                    self.registry.iter().enumerate().all(|(index, species)| {
                        !(stock.biomass_of(index, species) > 0.0)
                    })
                }
                _ => false,
            };
            if barren {
                if let Some(stock) = self.arena.get_mut(id) {
                    stock.make_wasteland();
                }
                retired += 1;
            }
        }
        retired
    }

    fn stage_movement(&mut self) {
        for task_idx in 0..self.order.len() {
            let id = self.order[task_idx];
            let Some(slot) = self.tasks.get_mut(id) else {
                continue;
            };
            match slot {
                ProcessSlot::BiomassMovement { species, rule } => {
                    rule.step(&mut self.arena, *species);
                }
                ProcessSlot::AbundanceMovement { species, rule } => {
                    rule.step(&mut self.arena, *species);
                }
                _ => {}
            }
        }
    }

    fn stage_biology(&mut self) -> Result<(), StockError> {
        for task_idx in 0..self.order.len() {
            let id = self.order[task_idx];
            let Some(slot) = self.tasks.get_mut(id) else {
                continue;
            };
            match slot {
                ProcessSlot::Natural(process) => {
                    process.step_year(&mut self.arena, &self.registry, &mut self.rng)?;
                }
                ProcessSlot::Logistic(grower) => grower.step_year(&mut self.arena),
                ProcessSlot::DelayDifference(grower) => {
                    grower.step_year(&mut self.arena, &mut self.rng);
                }
                ProcessSlot::Reallocation(realloc) => {
                    let species = self
                        .registry
                        .get(realloc.species_index())
                        .ok_or(StockError::UnknownSpecies(realloc.species_index()))?;
                    let total = self.arena.total_biomass(realloc.species_index(), species);
                    let clamped = realloc.apply_biomass(&mut self.arena, total);
                    if clamped > EPSILON {
                        self.warnings.over_capacity(clamped);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn stage_observation(&mut self, next: Tick) -> bool {
        let interval = self.config.observation_interval;
        if interval == 0 || !next.0.is_multiple_of(u64::from(interval)) {
            return false;
        }

        let stocks: Vec<&LocalStock> = self.arena.iter().map(|(_, stock)| stock).collect();
        let total_biomass: Vec<f64> = self
            .registry
            .iter()
            .enumerate()
            .map(|(index, species)| {
                stocks
                    .par_iter()
                    .map(|stock| stock.biomass_of(index, species))
                    .sum()
            })
            .collect();
        let habitable_cells = stocks.iter().filter(|stock| stock.is_habitable()).count();

        let mut last_recruits = vec![0.0; self.registry.len()];
        for slot in self.tasks.values() {
            match slot {
                ProcessSlot::Natural(process) => {
                    last_recruits[process.species_index()] = process.last_recruits();
                }
                ProcessSlot::DelayDifference(grower) => {
                    last_recruits[grower.species_index()] = grower.last_recruits();
                }
                _ => {}
            }
        }

        let summary = StockSummary {
            tick: next,
            year: next.0 / u64::from(self.config.days_per_year),
            habitable_cells,
            total_biomass,
            last_recruits,
        };
        let mut series = Vec::with_capacity(self.registry.len() * 2);
        for (index, species) in self.registry.iter().enumerate() {
            series.push(SeriesSample::new(
                format!("biomass.{}", species.name()),
                summary.total_biomass[index],
            ));
            series.push(SeriesSample::new(
                format!("recruits.{}", species.name()),
                summary.last_recruits[index],
            ));
        }

        let batch = ObservationBatch {
            summary: summary.clone(),
            series,
        };
        self.observer.on_tick(&batch);
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
        true
    }

    /// Advances one simulated day: movement, then (on year ends) the
    /// demographic and growth processes, then observation.
    pub fn step(&mut self) -> Result<TickEvents, StockError> {
        let next = self.tick.next();
        self.stage_movement();
        let year_rolled = next.0.is_multiple_of(u64::from(self.config.days_per_year));
        if year_rolled {
            self.stage_biology()?;
        }
        let observed = self.stage_observation(next);
        self.tick = next;
        Ok(TickEvents {
            tick: next,
            year_rolled,
            observed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn two_bin_species() -> Species {
        let meristics = Meristics::new(
            vec![vec![1.0, 1.0], vec![1.0, 1.0]],
            vec![vec![10.0, 20.0], vec![10.0, 20.0]],
            vec![0.0, 1.0],
            None,
            vec![vec![0.0, 0.0], vec![0.0, 0.0]],
        )
        .expect("meristics");
        Species::new("testfish", "TST", meristics)
    }

    fn three_bin_species() -> Species {
        let meristics = Meristics::new(
            vec![vec![10.0, 20.0, 30.0], vec![10.0, 20.0, 30.0]],
            vec![vec![1.0, 2.0, 3.0], vec![1.0, 2.0, 3.0]],
            vec![0.0, 0.5, 1.0],
            None,
            vec![vec![0.0, 0.0, 0.0], vec![0.0, 0.0, 0.0]],
        )
        .expect("meristics");
        Species::new("threebin", "THR", meristics)
    }

    fn single_bin_spawner() -> Species {
        let meristics = Meristics::new(
            vec![vec![2.0], vec![2.0]],
            vec![vec![10.0], vec![10.0]],
            vec![1.0],
            None,
            vec![vec![0.0], vec![0.0]],
        )
        .expect("meristics");
        Species::new("spawner", "SPW", meristics)
    }

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(0xF1_5Eu64)
    }

    #[test]
    fn meristics_reject_mismatched_tables() {
        let result = Meristics::new(
            vec![vec![1.0, 1.0]],
            vec![vec![1.0]],
            vec![0.0, 1.0],
            None,
            vec![vec![0.0, 0.0]],
        );
        assert!(matches!(result, Err(StockError::InvalidConfig(_))));

        let result = Meristics::new(
            vec![vec![1.0, 1.0]],
            vec![vec![1.0, 1.0]],
            vec![0.0],
            None,
            vec![vec![0.0, 0.0]],
        );
        assert!(matches!(result, Err(StockError::InvalidConfig(_))));
    }

    #[test]
    fn abundance_biomass_uses_per_bin_weights() {
        let species = three_bin_species();
        let mut matrix = Abundance::zeros(2, 3);
        matrix.set(FEMALE, 0, 2.0);
        matrix.set(MALE, 2, 1.0);
        assert!((matrix.biomass(species.meristics()) - (2.0 * 10.0 + 30.0)).abs() < 1e-12);
    }

    #[test]
    fn biomass_writes_are_clamped_into_capacity() {
        let mut stock = BiomassStock::new(1);
        stock.set_capacity(0, 100.0);
        assert_eq!(stock.set_biomass(0, 250.0), 100.0);
        assert_eq!(stock.set_biomass(0, -5.0), 0.0);
        assert_eq!(stock.set_biomass(0, f64::NAN), 0.0);
        stock.set_biomass(0, 80.0);
        stock.set_capacity(0, 50.0);
        assert_eq!(stock.biomass(0), 50.0);
    }

    #[test]
    fn abundance_cache_is_invalidated_by_mutable_access() {
        let species = single_bin_spawner();
        let registry = SpeciesRegistry::new(vec![species.clone()]).expect("registry");
        let mut stock = AbundanceStock::new(&registry);
        if let Some(matrix) = stock.abundance_mut(0) {
            matrix.set(FEMALE, 0, 10.0);
        }
        stock.warm_cache(&registry);
        assert_eq!(stock.biomass(0, species.meristics()), 20.0);
        if let Some(matrix) = stock.abundance_mut(0) {
            matrix.set(FEMALE, 0, 20.0);
        }
        assert_eq!(stock.biomass(0, species.meristics()), 40.0);
    }

    #[test]
    fn exponential_mortality_culls_without_going_negative() {
        let meristics = Meristics::new(
            vec![vec![1.0]],
            vec![vec![1.0]],
            vec![1.0],
            None,
            vec![vec![0.1]],
        )
        .expect("meristics");
        let mut matrix = Abundance::zeros(1, 1);
        matrix.set(0, 0, 100.0);
        apply_natural_mortality(&mut matrix, &meristics);
        assert!((matrix.get(0, 0) - 100.0 * (-0.1f64).exp()).abs() < 1e-9);
        assert!(matrix.get(0, 0) >= 0.0);
    }

    #[test]
    fn zero_mortality_is_a_noop() {
        let species = two_bin_species();
        let mut matrix = Abundance::zeros(2, 2);
        matrix.set(FEMALE, 1, 42.0);
        apply_natural_mortality(&mut matrix, species.meristics());
        assert_eq!(matrix.get(FEMALE, 1), 42.0);
    }

    #[test]
    fn aging_terminal_bin_dies_discards_oldest_cohort() {
        let mut matrix = Abundance::zeros(1, 2);
        matrix.set(0, 0, 50.0);
        matrix.set(0, 1, 30.0);
        age_cohorts(&mut matrix, TerminalBinPolicy::Dies, None);
        assert_eq!(matrix.row(0), &[0.0, 50.0]);
    }

    #[test]
    fn aging_preserves_last_age_when_configured() {
        let mut matrix = Abundance::zeros(1, 2);
        matrix.set(0, 0, 50.0);
        matrix.set(0, 1, 30.0);
        age_cohorts(&mut matrix, TerminalBinPolicy::PreserveLastAge, None);
        assert_eq!(matrix.row(0), &[0.0, 80.0]);
    }

    #[test]
    fn aging_conserves_counts_below_the_terminal_bin() {
        let mut matrix = Abundance::zeros(2, 4);
        for subdivision in 0..2 {
            for bin in 0..3 {
                matrix.set(subdivision, bin, (bin + 1) as f64 * 7.5);
            }
        }
        let movable: f64 = (0..2).map(|s| matrix.row(s)[..3].iter().sum::<f64>()).sum();
        age_cohorts(&mut matrix, TerminalBinPolicy::Dies, None);
        assert!((matrix.total() - movable).abs() < 1e-12);
    }

    #[test]
    fn rounding_carry_recovers_fractional_counts() {
        let mut matrix = Abundance::zeros(1, 3);
        let mut carry = Abundance::zeros(1, 3);
        matrix.set(0, 0, 0.5);
        age_cohorts(&mut matrix, TerminalBinPolicy::Dies, Some(&mut carry));
        assert_eq!(matrix.get(0, 1), 0.0);
        assert!((carry.get(0, 1) - 0.5).abs() < 1e-12);

        matrix.set(0, 0, 0.5);
        age_cohorts(&mut matrix, TerminalBinPolicy::Dies, Some(&mut carry));
        assert_eq!(matrix.get(0, 1), 1.0);
        assert!(carry.get(0, 1).abs() < 1e-12);
    }

    #[test]
    fn rounding_truncates_and_remembers_the_remainder() {
        let mut matrix = Abundance::zeros(1, 3);
        let mut carry = Abundance::zeros(1, 3);
        matrix.set(0, 0, 10.4);
        matrix.set(0, 1, 5.0);
        age_cohorts(&mut matrix, TerminalBinPolicy::Dies, Some(&mut carry));
        assert_eq!(matrix.row(0), &[0.0, 10.0, 5.0]);
        assert!((carry.get(0, 1) - 0.4).abs() < 1e-12);
    }

    #[test]
    fn beverton_holt_matches_the_reference_curve() {
        let species = single_bin_spawner();
        let mut total = Abundance::zeros(2, 1);
        total.set(FEMALE, 0, 1500.0); // spawning biomass 3000
        let mut rule = BevertonHoltRecruitment::new(1000.0, 0.7, 10.0).expect("rule");
        let recruits = rule.recruits(&species, &total, &mut rng());
        assert!((recruits - 800.0).abs() < 1e-9);
    }

    #[test]
    fn recruitment_is_zero_without_spawning_biomass() {
        let species = single_bin_spawner();
        let total = Abundance::zeros(2, 1);
        let mut beverton = BevertonHoltRecruitment::new(1000.0, 0.7, 10.0).expect("rule");
        assert_eq!(beverton.recruits(&species, &total, &mut rng()), 0.0);
        let mut hockey = HockeyStickRecruitment::new(500.0, 0.2, 1000.0).expect("rule");
        assert_eq!(hockey.recruits(&species, &total, &mut rng()), 0.0);
    }

    #[test]
    fn recruitment_is_monotonic_below_saturation() {
        let species = single_bin_spawner();
        let mut beverton = BevertonHoltRecruitment::new(1000.0, 0.7, 10.0).expect("rule");
        let mut hockey = HockeyStickRecruitment::new(500.0, 0.5, 4000.0).expect("rule");
        let mut rng = rng();
        let mut previous_bh = 0.0;
        let mut previous_hs = 0.0;
        for females in (0..40).map(|step| step as f64 * 25.0) {
            let mut total = Abundance::zeros(2, 1);
            total.set(FEMALE, 0, females);
            let bh = beverton.recruits(&species, &total, &mut rng);
            let hs = hockey.recruits(&species, &total, &mut rng);
            assert!(bh >= previous_bh);
            assert!(hs >= previous_hs);
            previous_bh = bh;
            previous_hs = hs;
        }
    }

    #[test]
    fn hockey_stick_saturates_at_virgin_recruits() {
        let species = single_bin_spawner();
        let mut rule = HockeyStickRecruitment::new(500.0, 0.2, 1000.0).expect("rule");
        let mut rng = rng();

        let mut total = Abundance::zeros(2, 1);
        total.set(FEMALE, 0, 50.0); // ssb 100, knee 200
        assert!((rule.recruits(&species, &total, &mut rng) - 250.0).abs() < 1e-9);

        total.set(FEMALE, 0, 2500.0); // ssb 5000, far past the knee
        assert!((rule.recruits(&species, &total, &mut rng) - 500.0).abs() < 1e-9);
    }

    #[test]
    fn delayed_recruitment_evaluates_lagged_spawning_biomass() {
        let species = single_bin_spawner();
        let base = BevertonHoltRecruitment::new(1000.0, 0.7, 10.0).expect("rule");
        let mut rule = DelayedRecruitment::new(base, 2, 3000.0).expect("rule");
        let mut rng = rng();

        let empty = Abundance::zeros(2, 1);
        // The virgin-prefilled buffer covers the first `lag` periods.
        assert!((rule.recruits(&species, &empty, &mut rng) - 800.0).abs() < 1e-9);
        assert!((rule.recruits(&species, &empty, &mut rng) - 800.0).abs() < 1e-9);
        // After the lag the observed collapse arrives.
        assert_eq!(rule.recruits(&species, &empty, &mut rng), 0.0);
    }

    #[test]
    fn recruitment_noise_scales_the_cohort() {
        let species = single_bin_spawner();
        let mut total = Abundance::zeros(2, 1);
        total.set(FEMALE, 0, 1500.0);
        let mut rule = BevertonHoltRecruitment::new(1000.0, 0.7, 10.0)
            .expect("rule")
            .with_noise(Box::new(|_| 0.5));
        let recruits = rule.recruits(&species, &total, &mut rng());
        assert!((recruits - 1200.0).abs() < 1e-9);
    }

    #[test]
    fn natural_process_rejects_duplicate_cells() {
        let rule = HockeyStickRecruitment::new(40.0, 1.0, 1.0).expect("rule");
        let mut process = NaturalProcess::new(0, Box::new(rule), TerminalBinPolicy::Dies, false);
        let registry = SpeciesRegistry::new(vec![two_bin_species()]).expect("registry");
        let mut arena = CellArena::new();
        let cell = arena.insert(LocalStock::Abundance(AbundanceStock::new(&registry)));
        process.track_cell(cell).expect("first registration");
        assert!(matches!(
            process.track_cell(cell),
            Err(StockError::DuplicateCell)
        ));
    }

    #[test]
    fn yearly_step_culls_ages_and_recruits_where_the_biomass_is() {
        let registry = SpeciesRegistry::new(vec![two_bin_species()]).expect("registry");
        let mut arena = CellArena::new();
        let occupied = arena.insert(LocalStock::Abundance(AbundanceStock::new(&registry)));
        let empty = arena.insert(LocalStock::Abundance(AbundanceStock::new(&registry)));
        if let Some(matrix) = arena.get_mut(occupied).and_then(|s| s.abundance_mut(0)) {
            for subdivision in 0..2 {
                matrix.set(subdivision, 0, 10.0);
                matrix.set(subdivision, 1, 10.0);
            }
        }

        let rule = HockeyStickRecruitment::new(40.0, 1.0, 1.0).expect("rule");
        let mut process = NaturalProcess::new(0, Box::new(rule), TerminalBinPolicy::Dies, false);
        process.track_cell(occupied).expect("track");
        process.track_cell(empty).expect("track");
        process
            .step_year(&mut arena, &registry, &mut rng())
            .expect("step");

        assert_eq!(process.last_recruits(), 40.0);
        let matrix = arena
            .get(occupied)
            .and_then(|s| s.abundance(0))
            .expect("matrix");
        for subdivision in 0..2 {
            assert_eq!(matrix.get(subdivision, 0), 20.0);
            assert_eq!(matrix.get(subdivision, 1), 10.0);
        }
        let untouched = arena.get(empty).and_then(|s| s.abundance(0)).expect("matrix");
        assert_eq!(untouched.total(), 0.0);
    }

    #[test]
    fn recruit_allocator_overrides_the_biomass_distribution() {
        let registry = SpeciesRegistry::new(vec![two_bin_species()]).expect("registry");
        let mut arena = CellArena::new();
        let occupied = arena.insert(LocalStock::Abundance(AbundanceStock::new(&registry)));
        let refuge = arena.insert(LocalStock::Abundance(AbundanceStock::new(&registry)));
        if let Some(matrix) = arena.get_mut(occupied).and_then(|s| s.abundance_mut(0)) {
            matrix.set(FEMALE, 1, 10.0);
        }

        let mut allocator = WeightMap::new();
        allocator.insert(occupied, 0.0);
        allocator.insert(refuge, 1.0);
        let rule = HockeyStickRecruitment::new(40.0, 1.0, 1.0).expect("rule");
        let mut process = NaturalProcess::new(0, Box::new(rule), TerminalBinPolicy::Dies, false)
            .with_recruit_allocator(allocator);
        process.track_cell(occupied).expect("track");
        process.track_cell(refuge).expect("track");
        process
            .step_year(&mut arena, &registry, &mut rng())
            .expect("step");

        let matrix = arena.get(refuge).and_then(|s| s.abundance(0)).expect("matrix");
        assert_eq!(matrix.get(FEMALE, 0), 20.0);
        assert_eq!(matrix.get(MALE, 0), 20.0);
        let spawning_ground = arena
            .get(occupied)
            .and_then(|s| s.abundance(0))
            .expect("matrix");
        assert_eq!(spawning_ground.get(FEMALE, 0), 0.0);
    }

    #[test]
    fn recruit_allocator_must_cover_every_tracked_cell() {
        let registry = SpeciesRegistry::new(vec![two_bin_species()]).expect("registry");
        let mut arena = CellArena::new();
        let covered = arena.insert(LocalStock::Abundance(AbundanceStock::new(&registry)));
        let uncovered = arena.insert(LocalStock::Abundance(AbundanceStock::new(&registry)));
        if let Some(matrix) = arena.get_mut(covered).and_then(|s| s.abundance_mut(0)) {
            matrix.set(FEMALE, 1, 10.0);
        }

        let mut allocator = WeightMap::new();
        allocator.insert(covered, 1.0);
        let rule = HockeyStickRecruitment::new(40.0, 1.0, 1.0).expect("rule");
        let mut process = NaturalProcess::new(0, Box::new(rule), TerminalBinPolicy::Dies, false)
            .with_recruit_allocator(allocator);
        process.track_cell(covered).expect("track");
        process.track_cell(uncovered).expect("track");
        assert!(matches!(
            process.step_year(&mut arena, &registry, &mut rng()),
            Err(StockError::WeightCoverage(_))
        ));
    }

    fn biomass_pair(capacity: f64, left: f64, right: f64) -> (CellArena, CellId, CellId) {
        let mut arena = CellArena::new();
        let mut stock = BiomassStock::new(1);
        stock.set_capacity(0, capacity);
        stock.set_biomass(0, left);
        let a = arena.insert(LocalStock::Biomass(stock));
        let mut stock = BiomassStock::new(1);
        stock.set_capacity(0, capacity);
        stock.set_biomass(0, right);
        let b = arena.insert(LocalStock::Biomass(stock));
        arena.connect(a, b);
        (arena, a, b)
    }

    #[test]
    fn differential_diffuser_moves_half_the_differential_fraction() {
        let (mut arena, a, b) = biomass_pair(1e6, 100.0, 0.0);
        let mut rule = BiomassMovement::differential(0.5, 1.0).expect("rule");
        rule.step(&mut arena, 0);
        let species = single_bin_spawner();
        assert!((arena.get(a).map(|s| s.biomass_of(0, &species)).unwrap_or(0.0) - 75.0).abs() < 1e-9);
        assert!((arena.get(b).map(|s| s.biomass_of(0, &species)).unwrap_or(0.0) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn daily_limit_caps_what_a_donor_can_lose() {
        let (mut arena, a, b) = biomass_pair(1e6, 100.0, 0.0);
        let mut rule = BiomassMovement::differential(1.0, 0.1).expect("rule");
        rule.step(&mut arena, 0);
        let species = single_bin_spawner();
        assert!((arena.get(a).map(|s| s.biomass_of(0, &species)).unwrap_or(0.0) - 90.0).abs() < 1e-9);
        assert!((arena.get(b).map(|s| s.biomass_of(0, &species)).unwrap_or(0.0) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn daily_limit_compounds_across_multiple_poorer_neighbors() {
        // The limit binds per pair against live values, so a donor facing k
        // poorer neighbors loses 1 - (1 - limit)^k of its opening biomass.
        let mut arena = CellArena::new();
        let mut stock = BiomassStock::new(1);
        stock.set_capacity(0, 1e6);
        stock.set_biomass(0, 100.0);
        let center = arena.insert(LocalStock::Biomass(stock));
        let neighbors: Vec<CellId> = (0..3)
            .map(|_| {
                let mut stock = BiomassStock::new(1);
                stock.set_capacity(0, 1e6);
                arena.insert(LocalStock::Biomass(stock))
            })
            .collect();
        for &neighbor in &neighbors {
            arena.connect(center, neighbor);
        }

        let mut rule = BiomassMovement::differential(1.0, 0.1).expect("rule");
        rule.step(&mut arena, 0);

        let species = single_bin_spawner();
        let held = |id: CellId| arena.get(id).map(|s| s.biomass_of(0, &species)).unwrap_or(0.0);
        assert!((held(center) - 72.9).abs() < 1e-9);
        assert!((held(neighbors[0]) - 10.0).abs() < 1e-9);
        assert!((held(neighbors[1]) - 9.0).abs() < 1e-9);
        assert!((held(neighbors[2]) - 8.1).abs() < 1e-9);
        let total: f64 = std::iter::once(center)
            .chain(neighbors.iter().copied())
            .map(held)
            .sum();
        assert!((total - 100.0).abs() < 1e-9);
    }

    #[test]
    fn diffusion_conserves_total_biomass() {
        let species = single_bin_spawner();
        let mut arena = CellArena::new();
        let mut ids = Vec::new();
        for biomass in [100.0, 40.0, 10.0, 0.0] {
            let mut stock = BiomassStock::new(1);
            stock.set_capacity(0, 1000.0);
            stock.set_biomass(0, biomass);
            ids.push(arena.insert(LocalStock::Biomass(stock)));
        }
        for window in ids.windows(2) {
            arena.connect(window[0], window[1]);
        }
        arena.connect(ids[3], ids[0]);

        let before = arena.total_biomass(0, &species);
        let mut rule = BiomassMovement::differential(0.3, 0.2).expect("rule");
        for _ in 0..50 {
            rule.step(&mut arena, 0);
        }
        let after = arena.total_biomass(0, &species);
        assert!((after - before).abs() / before < 1e-6);
        for id in ids {
            assert!(arena.get(id).map(|s| s.biomass_of(0, &species)).unwrap_or(0.0) >= 0.0);
        }
    }

    #[test]
    fn smoothed_movement_tracks_the_target_series() {
        let mut arena = CellArena::new();
        let mut stock = BiomassStock::new(1);
        stock.set_capacity(0, 100.0);
        let cell = arena.insert(LocalStock::Biomass(stock));
        let mut rule = BiomassMovement::smoothed(0.5, vec![50.0]).expect("rule");
        let species = single_bin_spawner();

        rule.step(&mut arena, 0);
        assert!((arena.get(cell).map(|s| s.biomass_of(0, &species)).unwrap_or(0.0) - 25.0).abs() < 1e-9);
        // The series is exhausted; the last target keeps applying.
        rule.step(&mut arena, 0);
        assert!((arena.get(cell).map(|s| s.biomass_of(0, &species)).unwrap_or(0.0) - 37.5).abs() < 1e-9);
    }

    fn abundance_pair(registry: &SpeciesRegistry) -> (CellArena, CellId, CellId) {
        let mut arena = CellArena::new();
        let a = arena.insert(LocalStock::Abundance(AbundanceStock::new(registry)));
        let b = arena.insert(LocalStock::Abundance(AbundanceStock::new(registry)));
        arena.connect(a, b);
        (arena, a, b)
    }

    #[test]
    fn abundance_diffuser_equalizes_a_pair_at_full_rate() {
        let registry = SpeciesRegistry::new(vec![three_bin_species()]).expect("registry");
        let (mut arena, full, empty) = abundance_pair(&registry);
        if let Some(matrix) = arena.get_mut(full).and_then(|s| s.abundance_mut(0)) {
            matrix.set(MALE, 0, 1000.0);
            matrix.set(MALE, 1, 500.0);
            matrix.set(FEMALE, 2, 10.0);
        }

        let diffuser = AbundanceDiffuser::new(0.5).expect("diffuser");
        diffuser.step(&mut arena, 0);

        for id in [full, empty] {
            let matrix = arena.get(id).and_then(|s| s.abundance(0)).expect("matrix");
            assert_eq!(matrix.row(MALE), &[500.0, 250.0, 0.0]);
            assert_eq!(matrix.row(FEMALE), &[0.0, 0.0, 5.0]);
        }
    }

    #[test]
    fn abundance_diffuser_moves_a_tenth_per_tick() {
        let registry = SpeciesRegistry::new(vec![three_bin_species()]).expect("registry");
        let (mut arena, full, empty) = abundance_pair(&registry);
        if let Some(matrix) = arena.get_mut(full).and_then(|s| s.abundance_mut(0)) {
            matrix.set(MALE, 0, 1000.0);
            matrix.set(MALE, 1, 500.0);
            matrix.set(FEMALE, 2, 10.0);
        }

        let diffuser = AbundanceDiffuser::new(0.1).expect("diffuser");
        diffuser.step(&mut arena, 0);
        {
            let matrix = arena.get(full).and_then(|s| s.abundance(0)).expect("matrix");
            assert_eq!(matrix.row(MALE), &[900.0, 450.0, 0.0]);
            let matrix = arena.get(empty).and_then(|s| s.abundance(0)).expect("matrix");
            assert_eq!(matrix.row(MALE), &[100.0, 50.0, 0.0]);
        }
        diffuser.step(&mut arena, 0);
        let matrix = arena.get(full).and_then(|s| s.abundance(0)).expect("matrix");
        assert_eq!(matrix.row(MALE), &[820.0, 410.0, 0.0]);
        let matrix = arena.get(empty).and_then(|s| s.abundance(0)).expect("matrix");
        assert_eq!(matrix.row(MALE), &[180.0, 90.0, 0.0]);
    }

    #[test]
    fn weight_map_coverage_mismatch_is_fatal() {
        let mut arena = CellArena::new();
        let covered = arena.insert(LocalStock::Biomass(BiomassStock::new(1)));
        let uncovered = arena.insert(LocalStock::Biomass(BiomassStock::new(1)));
        let outsider = arena.insert(LocalStock::Biomass(BiomassStock::new(1)));

        let mut weights = WeightMap::new();
        weights.insert(covered, 1.0);
        assert!(matches!(
            Reallocator::new(0, &weights, &[covered, uncovered]),
            Err(StockError::WeightCoverage(_))
        ));

        weights.insert(uncovered, 1.0);
        weights.insert(outsider, 1.0);
        assert!(matches!(
            Reallocator::new(0, &weights, &[covered, uncovered]),
            Err(StockError::WeightCoverage(_))
        ));
    }

    #[test]
    fn degenerate_weight_sums_are_rejected() {
        let mut arena = CellArena::new();
        let cell = arena.insert(LocalStock::Biomass(BiomassStock::new(1)));
        let mut weights = WeightMap::new();
        weights.insert(cell, 0.0);
        assert!(matches!(
            weights.normalized(),
            Err(StockError::InvalidConfig(_))
        ));
        weights.insert(cell, f64::NAN);
        assert!(matches!(
            weights.normalized(),
            Err(StockError::InvalidConfig(_))
        ));
    }

    #[test]
    fn reallocation_shares_follow_the_weights() {
        let (mut arena, a, b) = biomass_pair(1000.0, 0.0, 0.0);
        let mut weights = WeightMap::new();
        weights.insert(a, 3.0);
        weights.insert(b, 1.0);
        let realloc = Reallocator::new(0, &weights, &[a, b]).expect("reallocator");
        let clamped = realloc.apply_biomass(&mut arena, 100.0);
        assert_eq!(clamped, 0.0);

        let species = single_bin_spawner();
        let left = arena.get(a).map(|s| s.biomass_of(0, &species)).unwrap_or(0.0);
        let right = arena.get(b).map(|s| s.biomass_of(0, &species)).unwrap_or(0.0);
        assert!((left - 75.0).abs() < 1e-9);
        assert!((right - 25.0).abs() < 1e-9);
        assert!((left + right - 100.0).abs() < 1e-9);
    }

    #[test]
    fn reset_to_pristine_is_idempotent() {
        let (mut arena, a, b) = biomass_pair(1000.0, 0.0, 0.0);
        let mut weights = WeightMap::new();
        weights.insert(a, 2.0);
        weights.insert(b, 1.0);
        let realloc = Reallocator::new(0, &weights, &[a, b]).expect("reallocator");

        realloc.reset_to_pristine(&mut arena, 90.0);
        let first: Vec<LocalStock> = arena.iter().map(|(_, s)| s.clone()).collect();
        realloc.reset_to_pristine(&mut arena, 90.0);
        let second: Vec<LocalStock> = arena.iter().map(|(_, s)| s.clone()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn abundance_reallocation_scales_the_aggregate_matrix() {
        let registry = SpeciesRegistry::new(vec![three_bin_species()]).expect("registry");
        let mut arena = CellArena::new();
        let a = arena.insert(LocalStock::Abundance(AbundanceStock::new(&registry)));
        let b = arena.insert(LocalStock::Abundance(AbundanceStock::new(&registry)));
        let mut weights = WeightMap::new();
        weights.insert(a, 3.0);
        weights.insert(b, 1.0);
        let realloc = Reallocator::new(0, &weights, &[a, b]).expect("reallocator");

        let mut total = Abundance::zeros(2, 3);
        total.set(MALE, 0, 8.0);
        total.set(MALE, 1, 4.0);
        total.set(FEMALE, 2, 4.0);
        realloc.apply_abundance(&mut arena, &total);

        let in_a = arena.get(a).and_then(|s| s.abundance(0)).expect("matrix");
        let in_b = arena.get(b).and_then(|s| s.abundance(0)).expect("matrix");
        assert_eq!(*in_a, total.scaled(0.75));
        assert_eq!(*in_b, total.scaled(0.25));
        for subdivision in 0..2 {
            for bin in 0..3 {
                let sum = in_a.get(subdivision, bin) + in_b.get(subdivision, bin);
                assert!((sum - total.get(subdivision, bin)).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn logistic_growth_is_capacity_bounded() {
        let mut grower = LogisticGrower::new(0, 0.5).expect("grower");
        let (mut arena, a, b) = biomass_pair(100.0, 50.0, 100.0);
        grower.track_cell(a).expect("track");
        grower.track_cell(b).expect("track");
        grower.step_year(&mut arena);

        let species = single_bin_spawner();
        assert!((arena.get(a).map(|s| s.biomass_of(0, &species)).unwrap_or(0.0) - 62.5).abs() < 1e-9);
        assert_eq!(arena.get(b).map(|s| s.biomass_of(0, &species)).unwrap_or(0.0), 100.0);
    }

    #[test]
    fn delay_difference_step_matches_hand_computation() {
        // rho = 0 collapses the update to survival plus recruitment, which is
        // easy to verify by hand.
        let mut previous: VecDeque<f64> = [500.0, 800.0].into_iter().collect();
        let mut survival: VecDeque<f64> = [0.5, 0.5].into_iter().collect();
        let step = delay_difference_step(
            1000.0, 2000.0, &mut previous, &mut survival, 0.5, 0.25, 1.0, 0.0, 1.0, 0.0,
        );
        assert!((step.recruits - 307.692_307_692_307_7).abs() < 1e-9);
        assert!((step.biomass - 807.692_307_692_307_7).abs() < 1e-9);
        assert_eq!(previous.len(), 2);
        assert!((previous[1] - step.biomass).abs() < 1e-12);
        assert!((survival[1] - 0.625).abs() < 1e-12);
    }

    #[test]
    #[should_panic(expected = "biomass queue must span the lag")]
    fn delay_difference_step_requires_a_seeded_queue() {
        let mut previous: VecDeque<f64> = [500.0].into_iter().collect();
        let mut survival: VecDeque<f64> = [0.5, 0.5].into_iter().collect();
        delay_difference_step(
            1000.0, 2000.0, &mut previous, &mut survival, 0.5, 0.25, 1.0, 0.0, 1.0, 0.0,
        );
    }

    #[test]
    fn pooled_grower_projects_the_aggregate_and_scatters_the_delta() {
        let mut grower = DerisoSchnuteGrower::new(
            0,
            0.0,
            0.5,
            0.25,
            2,
            1.0,
            1.0,
            &[500.0, 800.0],
            Some(&[0.5, 0.5]),
            0.0,
        )
        .expect("grower");
        let (mut arena, a, b) = biomass_pair(1000.0, 500.0, 500.0);
        grower.track_cell(a).expect("track");
        grower.track_cell(b).expect("track");
        grower.step_year(&mut arena, &mut rng());

        assert!((grower.last_recruits() - 307.692_307_692_307_7).abs() < 1e-9);
        let species = single_bin_spawner();
        let total = arena.total_biomass(0, &species);
        assert!((total - 807.692_307_692_307_7).abs() < 1e-3);
        for id in [a, b] {
            let held = arena.get(id).map(|s| s.biomass_of(0, &species)).unwrap_or(0.0);
            assert!((0.0..=1000.0).contains(&held));
        }
    }

    #[test]
    fn random_allocation_respects_capacity_and_floor() {
        let (mut arena, small, large) = biomass_pair(100.0, 0.0, 0.0);
        if let Some(LocalStock::Biomass(stock)) = arena.get_mut(small) {
            stock.set_capacity(0, 10.0);
            stock.set_biomass(0, 9.0);
        }
        let mut candidates = vec![small, large];
        allocate_biomass_at_random(&mut arena, &mut candidates, 0, 20.0, &mut rng());

        let species = single_bin_spawner();
        let in_small = arena.get(small).map(|s| s.biomass_of(0, &species)).unwrap_or(0.0);
        let in_large = arena.get(large).map(|s| s.biomass_of(0, &species)).unwrap_or(0.0);
        assert!(in_small <= 10.0 + 1e-9);
        assert!((in_small + in_large - 29.0).abs() < 1e-3);

        let mut candidates = vec![small, large];
        allocate_biomass_at_random(&mut arena, &mut candidates, 0, -50.0, &mut rng());
        let in_small = arena.get(small).map(|s| s.biomass_of(0, &species)).unwrap_or(0.0);
        let in_large = arena.get(large).map(|s| s.biomass_of(0, &species)).unwrap_or(0.0);
        assert!(in_small >= 0.0 && in_large >= 0.0);
        assert!(in_small + in_large < 1e-3);
    }

    #[test]
    fn config_validation_rejects_degenerate_values() {
        let config = StockConfig {
            days_per_year: 0,
            ..StockConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StockError::InvalidConfig(_))
        ));
        let config = StockConfig {
            history_capacity: 0,
            ..StockConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StockError::InvalidConfig(_))
        ));
    }

    #[test]
    fn seeding_marks_bad_habitat_as_wasteland() {
        let registry = SpeciesRegistry::new(vec![single_bin_spawner()]).expect("registry");
        let config = StockConfig {
            rng_seed: Some(7),
            ..StockConfig::default()
        };
        let mut world = StockWorld::new(config, registry).expect("world");
        let barren = world.add_biomass_cell();
        let left = world.add_biomass_cell();
        let right = world.add_biomass_cell();

        world
            .seed_biomass(0, 1000.0, 500.0, |id, _| {
                if id == barren { f64::NAN } else { 1.0 }
            })
            .expect("seeding");

        assert!(matches!(world.arena().get(barren), Some(LocalStock::Empty)));
        let species = world.registry().get(0).expect("species").clone();
        for id in [left, right] {
            let stock = world.arena().get(id).expect("cell");
            assert!((stock.biomass_of(0, &species) - 250.0).abs() < 1e-9);
            assert!((stock.capacity_of(0) - 500.0).abs() < 1e-9);
        }
    }

    #[test]
    fn seeding_clamps_initial_biomass_to_capacity() {
        let registry = SpeciesRegistry::new(vec![single_bin_spawner()]).expect("registry");
        let mut world = StockWorld::new(StockConfig::default(), registry).expect("world");
        let a = world.add_biomass_cell();
        let b = world.add_biomass_cell();
        world
            .seed_biomass(0, 100.0, 200.0, |_, _| 1.0)
            .expect("seeding");

        let species = world.registry().get(0).expect("species").clone();
        for id in [a, b] {
            let stock = world.arena().get(id).expect("cell");
            assert!((stock.biomass_of(0, &species) - 50.0).abs() < 1e-9);
        }
    }

    #[test]
    fn barren_cells_retire_to_wasteland() {
        let registry = SpeciesRegistry::new(vec![single_bin_spawner()]).expect("registry");
        let mut world = StockWorld::new(StockConfig::default(), registry).expect("world");
        let stocked = world.add_biomass_cell();
        let barren = world.add_biomass_cell();
        if let Some(LocalStock::Biomass(stock)) = world.arena_mut().get_mut(stocked) {
            stock.set_capacity(0, 100.0);
            stock.set_biomass(0, 10.0);
        }

        assert_eq!(world.retire_barren_cells(), 1);
        assert!(matches!(world.arena().get(barren), Some(LocalStock::Empty)));
        assert!(world.arena().get(stocked).is_some_and(LocalStock::is_habitable));
    }

    #[test]
    fn a_species_accepts_only_one_growth_process() {
        let registry = SpeciesRegistry::new(vec![single_bin_spawner()]).expect("registry");
        let mut world = StockWorld::new(StockConfig::default(), registry).expect("world");
        let grower = LogisticGrower::new(0, 0.5).expect("grower");
        world.register_logistic_grower(grower).expect("first");
        let rule = HockeyStickRecruitment::new(40.0, 1.0, 1.0).expect("rule");
        let process = NaturalProcess::new(0, Box::new(rule), TerminalBinPolicy::Dies, false);
        assert!(matches!(
            world.register_natural_process(process),
            Err(StockError::InvalidConfig(_))
        ));
    }

    #[test]
    fn cancelled_processes_stop_mutating() {
        let registry = SpeciesRegistry::new(vec![single_bin_spawner()]).expect("registry");
        let config = StockConfig {
            days_per_year: 1,
            rng_seed: Some(11),
            ..StockConfig::default()
        };
        let mut world = StockWorld::new(config, registry).expect("world");
        let cell = world.add_biomass_cell();
        if let Some(LocalStock::Biomass(stock)) = world.arena_mut().get_mut(cell) {
            stock.set_capacity(0, 100.0);
            stock.set_biomass(0, 10.0);
        }
        let mut grower = LogisticGrower::new(0, 1.0).expect("grower");
        grower.track_cell(cell).expect("track");
        let task = world.register_logistic_grower(grower).expect("register");

        world.step().expect("step");
        let species = world.registry().get(0).expect("species").clone();
        let grown = world
            .arena()
            .get(cell)
            .map(|s| s.biomass_of(0, &species))
            .unwrap_or(0.0);
        assert!((grown - 19.0).abs() < 1e-9);

        assert!(world.cancel(task));
        assert!(!world.cancel(task));
        world.step().expect("step");
        let still = world
            .arena()
            .get(cell)
            .map(|s| s.biomass_of(0, &species))
            .unwrap_or(0.0);
        assert_eq!(still, grown);
    }

    #[derive(Default)]
    struct SpyObserver {
        batches: Arc<Mutex<Vec<ObservationBatch>>>,
    }

    impl StockObserver for SpyObserver {
        fn on_tick(&mut self, batch: &ObservationBatch) {
            if let Ok(mut batches) = self.batches.lock() {
                batches.push(batch.clone());
            }
        }
    }

    #[test]
    fn observer_receives_named_series_after_each_tick() {
        let registry = SpeciesRegistry::new(vec![single_bin_spawner()]).expect("registry");
        let batches = Arc::new(Mutex::new(Vec::new()));
        let spy = SpyObserver {
            batches: Arc::clone(&batches),
        };
        let config = StockConfig {
            observation_interval: 1,
            ..StockConfig::default()
        };
        let mut world = StockWorld::with_observer(config, registry, Box::new(spy)).expect("world");
        let cell = world.add_biomass_cell();
        if let Some(LocalStock::Biomass(stock)) = world.arena_mut().get_mut(cell) {
            stock.set_capacity(0, 100.0);
            stock.set_biomass(0, 42.0);
        }

        let events = world.step().expect("step");
        assert!(events.observed);

        let recorded = batches.lock().expect("lock");
        assert_eq!(recorded.len(), 1);
        let batch = &recorded[0];
        assert_eq!(batch.summary.tick, Tick(1));
        assert!((batch.summary.total_biomass[0] - 42.0).abs() < 1e-9);
        assert!(batch.series.iter().any(|s| s.name == "biomass.spawner"));
        assert!(batch.series.iter().any(|s| s.name == "recruits.spawner"));
        assert_eq!(world.history().count(), 1);
    }

    #[test]
    fn history_is_bounded_by_capacity() {
        let registry = SpeciesRegistry::new(vec![single_bin_spawner()]).expect("registry");
        let config = StockConfig {
            history_capacity: 4,
            ..StockConfig::default()
        };
        let mut world = StockWorld::new(config, registry).expect("world");
        for _ in 0..10 {
            world.step().expect("step");
        }
        assert_eq!(world.history().count(), 4);
        let oldest = world.history().next().expect("summary");
        assert_eq!(oldest.tick, Tick(7));
    }
}
