//! Temporal Memory implementation.
//!
//! The Temporal Memory algorithm learns temporal sequences by forming distal
//! connections between cells. Each call to [`TemporalMemory::compute`] runs
//! one timestep: active columns are classified as predicted or bursting using
//! the segment state from the previous step, segments are adapted, and the
//! graph is depolarized to predict the next step.

use crate::algorithms::connections::TokenReader;
use crate::algorithms::{Connections, ConnectionsParams};
use crate::error::{Result, VelesError};
use crate::types::{
    CellIdx, Iteration, Permanence, Segment, SegmentIdx, SynapseIdx, UInt, MAX_PERMANENCE,
    MIN_PERMANENCE,
};
use crate::utils::Random;

use std::io::{BufReader, Read, Write};

/// Parameters for creating a Temporal Memory.
#[derive(Debug, Clone)]
pub struct TemporalMemoryParams {
    /// Dimensions of the column space; the product is the number of columns.
    pub column_dimensions: Vec<UInt>,

    /// Number of cells per column.
    pub cells_per_column: UInt,

    /// Connected-synapse count at which a segment becomes active.
    pub activation_threshold: UInt,

    /// Permanence of newly grown synapses.
    pub initial_permanence: Permanence,

    /// Permanence threshold for a synapse to be considered connected.
    pub connected_permanence: Permanence,

    /// Potential-synapse count at which a segment becomes matching.
    pub min_threshold: UInt,

    /// Target fan-in when growing new synapses.
    pub max_new_synapse_count: UInt,

    /// Amount added to the permanence of active synapses during learning.
    pub permanence_increment: Permanence,

    /// Amount subtracted from the permanence of inactive synapses during
    /// learning.
    pub permanence_decrement: Permanence,

    /// Penalty applied to matching segments in columns that fail to activate.
    pub predicted_segment_decrement: Permanence,

    /// Random seed for all tie-breaks and sampling.
    pub seed: i64,

    /// Maximum number of segments per cell.
    pub max_segments_per_cell: UInt,

    /// Maximum number of synapses per segment.
    pub max_synapses_per_segment: UInt,
}

impl Default for TemporalMemoryParams {
    fn default() -> Self {
        Self {
            column_dimensions: vec![2048],
            cells_per_column: 32,
            activation_threshold: 13,
            initial_permanence: 0.21,
            connected_permanence: 0.5,
            min_threshold: 10,
            max_new_synapse_count: 20,
            permanence_increment: 0.1,
            permanence_decrement: 0.1,
            predicted_segment_decrement: 0.0,
            seed: 42,
            max_segments_per_cell: 255,
            max_synapses_per_segment: 255,
        }
    }
}

/// The Temporal Memory algorithm.
///
/// Temporal Memory learns sequences by forming connections between cells in
/// different columns. After each compute it exposes the cells that are active
/// now and the cells predicted to become active in the next step.
///
/// # Example
///
/// ```rust
/// use veles::algorithms::{TemporalMemory, TemporalMemoryParams};
///
/// let mut tm = TemporalMemory::new(TemporalMemoryParams {
///     column_dimensions: vec![100],
///     cells_per_column: 4,
///     ..Default::default()
/// }).unwrap();
///
/// tm.compute(&[1, 5, 10, 20], true).unwrap();
///
/// let active_cells = tm.active_cells();
/// let predictive_cells = tm.predictive_cells();
/// ```
#[derive(Debug, Clone)]
pub struct TemporalMemory {
    // Configuration
    column_dimensions: Vec<UInt>,
    cells_per_column: UInt,
    num_columns: usize,
    num_cells: usize,
    activation_threshold: UInt,
    initial_permanence: Permanence,
    connected_permanence: Permanence,
    min_threshold: UInt,
    max_new_synapse_count: UInt,
    permanence_increment: Permanence,
    permanence_decrement: Permanence,
    predicted_segment_decrement: Permanence,
    max_segments_per_cell: UInt,
    max_synapses_per_segment: UInt,

    // Graph
    connections: Connections,

    // Per-timestep state. The `prev_*` vectors hold the previous step's
    // values and feed both learning and serialization.
    prev_active_cells: Vec<CellIdx>,
    active_cells: Vec<CellIdx>,
    prev_winner_cells: Vec<CellIdx>,
    winner_cells: Vec<CellIdx>,
    predictive_cells: Vec<CellIdx>,
    active_segments: Vec<Segment>,
    matching_segments: Vec<Segment>,
    num_active_connected_synapses_for_segment: Vec<UInt>,
    num_active_potential_synapses_for_segment: Vec<UInt>,

    // RNG
    rng: Random,
}

impl TemporalMemory {
    /// Current version of the serialized envelope.
    pub const VERSION: UInt = 2;

    /// Creates a new Temporal Memory with the given parameters.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::InvalidArgument`] if `column_dimensions` is
    /// empty or contains a zero, if `cells_per_column` is zero, or if the
    /// resulting cell count does not fit the cell index type.
    pub fn new(params: TemporalMemoryParams) -> Result<Self> {
        if params.column_dimensions.is_empty() {
            return Err(VelesError::InvalidArgument(
                "column_dimensions must not be empty".into(),
            ));
        }
        if params.column_dimensions.iter().any(|&dimension| dimension == 0) {
            return Err(VelesError::InvalidArgument(
                "column_dimensions must not contain zeros".into(),
            ));
        }
        if params.cells_per_column == 0 {
            return Err(VelesError::InvalidArgument(
                "cells_per_column must be at least 1".into(),
            ));
        }

        let num_columns: usize = params
            .column_dimensions
            .iter()
            .map(|&dimension| dimension as usize)
            .product();
        let num_cells = num_columns * params.cells_per_column as usize;
        if num_cells > CellIdx::MAX as usize {
            return Err(VelesError::InvalidArgument(format!(
                "{num_cells} cells exceed the cell index range"
            )));
        }

        let connections = Connections::new(ConnectionsParams {
            num_cells: num_cells as CellIdx,
            max_segments_per_cell: params.max_segments_per_cell as SegmentIdx,
            max_synapses_per_segment: params.max_synapses_per_segment as SynapseIdx,
        });

        Ok(Self {
            column_dimensions: params.column_dimensions,
            cells_per_column: params.cells_per_column,
            num_columns,
            num_cells,
            activation_threshold: params.activation_threshold,
            initial_permanence: params.initial_permanence,
            connected_permanence: params.connected_permanence,
            min_threshold: params.min_threshold,
            max_new_synapse_count: params.max_new_synapse_count,
            permanence_increment: params.permanence_increment,
            permanence_decrement: params.permanence_decrement,
            predicted_segment_decrement: params.predicted_segment_decrement,
            max_segments_per_cell: params.max_segments_per_cell,
            max_synapses_per_segment: params.max_synapses_per_segment,

            connections,

            prev_active_cells: Vec::new(),
            active_cells: Vec::new(),
            prev_winner_cells: Vec::new(),
            winner_cells: Vec::new(),
            predictive_cells: Vec::new(),
            active_segments: Vec::new(),
            matching_segments: Vec::new(),
            num_active_connected_synapses_for_segment: Vec::new(),
            num_active_potential_synapses_for_segment: Vec::new(),

            rng: Random::new(params.seed),
        })
    }

    /// Runs one timestep.
    ///
    /// `active_columns` must be strictly ascending, without duplicates, and
    /// within `[0, number_of_columns)`. Columns containing depolarized cells
    /// activate those cells; the rest burst. With `learn` set, segments are
    /// reinforced, punished, and grown. Afterwards the graph is depolarized
    /// for the next step, so [`TemporalMemory::predictive_cells`] reflects
    /// the upcoming prediction while the other accessors reflect this step.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::InvalidArgument`] for unsorted or out-of-range
    /// columns; the instance is left unchanged in that case.
    pub fn compute(&mut self, active_columns: &[UInt], learn: bool) -> Result<()> {
        self.validate_active_columns(active_columns)?;
        self.activate_cells(active_columns, learn)?;
        self.activate_dendrites();
        if learn {
            self.connections.start_new_iteration();
        }
        Ok(())
    }

    fn validate_active_columns(&self, active_columns: &[UInt]) -> Result<()> {
        for pair in active_columns.windows(2) {
            if pair[0] >= pair[1] {
                return Err(VelesError::InvalidArgument(
                    "active columns must be sorted ascending without duplicates".into(),
                ));
            }
        }
        if let Some(&last) = active_columns.last() {
            if last as usize >= self.num_columns {
                return Err(VelesError::InvalidArgument(format!(
                    "column {} out of range ({} columns)",
                    last, self.num_columns
                )));
            }
        }
        Ok(())
    }

    /// Activation, learning, and punishment phases of one timestep.
    fn activate_cells(&mut self, active_columns: &[UInt], learn: bool) -> Result<()> {
        let prev_active_cells = std::mem::take(&mut self.active_cells);
        let prev_winner_cells = std::mem::take(&mut self.winner_cells);
        let active_segments = std::mem::take(&mut self.active_segments);
        let matching_segments = std::mem::take(&mut self.matching_segments);

        // Both segment lists are sorted by (cell, idx_on_cell), so their
        // column order is nondecreasing and a single merge pass suffices.
        let mut active_cursor = 0;
        let mut matching_cursor = 0;

        for &column in active_columns {
            let column_active =
                self.segments_in_column(&active_segments, &mut active_cursor, column);
            let column_matching =
                self.segments_in_column(&matching_segments, &mut matching_cursor, column);

            if column_active.is_empty() {
                self.burst_column(
                    column,
                    column_matching,
                    &prev_active_cells,
                    &prev_winner_cells,
                    learn,
                )?;
            } else {
                self.activate_predicted_column(
                    column_active,
                    &prev_active_cells,
                    &prev_winner_cells,
                    learn,
                )?;
            }
        }

        if learn && self.predicted_segment_decrement > 0.0 {
            for &segment in &matching_segments {
                let column = self.column_of_cell(self.connections.cell_for_segment(segment));
                if active_columns.binary_search(&column).is_err() {
                    self.adapt_segment(
                        segment,
                        &prev_active_cells,
                        -self.predicted_segment_decrement,
                        0.0,
                    )?;
                }
            }
        }

        self.prev_active_cells = prev_active_cells;
        self.prev_winner_cells = prev_winner_cells;
        Ok(())
    }

    /// Advances `cursor` past segments in earlier columns and returns the
    /// contiguous run of segments owned by `column`.
    fn segments_in_column<'a>(
        &self,
        segments: &'a [Segment],
        cursor: &mut usize,
        column: UInt,
    ) -> &'a [Segment] {
        while *cursor < segments.len()
            && self.column_of_cell(self.connections.cell_for_segment(segments[*cursor])) < column
        {
            *cursor += 1;
        }
        let start = *cursor;
        while *cursor < segments.len()
            && self.column_of_cell(self.connections.cell_for_segment(segments[*cursor])) == column
        {
            *cursor += 1;
        }
        &segments[start..*cursor]
    }

    /// Activates the depolarized cells of a correctly predicted column and
    /// reinforces their active segments.
    fn activate_predicted_column(
        &mut self,
        column_active_segments: &[Segment],
        prev_active_cells: &[CellIdx],
        prev_winner_cells: &[CellIdx],
        learn: bool,
    ) -> Result<()> {
        let mut previous_cell = None;

        for &segment in column_active_segments {
            let cell = self.connections.cell_for_segment(segment);
            if previous_cell != Some(cell) {
                self.active_cells.push(cell);
                self.winner_cells.push(cell);
                previous_cell = Some(cell);
            }

            if learn {
                let survived = self.adapt_segment(
                    segment,
                    prev_active_cells,
                    self.permanence_increment,
                    self.permanence_decrement,
                )?;
                if survived {
                    let grow = (self.max_new_synapse_count as usize)
                        .saturating_sub(self.active_potential(segment));
                    if grow > 0 {
                        self.grow_synapses(segment, prev_winner_cells, grow)?;
                    }
                    self.connections.record_segment_activity(segment);
                }
            }
        }
        Ok(())
    }

    /// Activates every cell of an unpredicted column, selects its winner
    /// cell, and learns on the best matching (or a newly grown) segment.
    fn burst_column(
        &mut self,
        column: UInt,
        column_matching_segments: &[Segment],
        prev_active_cells: &[CellIdx],
        prev_winner_cells: &[CellIdx],
        learn: bool,
    ) -> Result<()> {
        let first_cell = column * self.cells_per_column;
        for cell in first_cell..first_cell + self.cells_per_column {
            self.active_cells.push(cell);
        }

        match self.best_matching_segment(column_matching_segments) {
            Some(segment) => {
                self.winner_cells
                    .push(self.connections.cell_for_segment(segment));

                if learn {
                    let survived = self.adapt_segment(
                        segment,
                        prev_active_cells,
                        self.permanence_increment,
                        self.permanence_decrement,
                    )?;
                    if survived {
                        let grow = (self.max_new_synapse_count as usize)
                            .saturating_sub(self.active_potential(segment));
                        if grow > 0 {
                            self.grow_synapses(segment, prev_winner_cells, grow)?;
                        }
                        self.connections.record_segment_activity(segment);
                    }
                }
            }
            None => {
                let winner_cell = self.least_used_cell(column);
                self.winner_cells.push(winner_cell);

                // Without previous winner cells a new segment could never
                // match, so it is not even grown.
                if learn && !prev_winner_cells.is_empty() {
                    let segment = self.connections.create_segment(winner_cell)?;
                    self.grow_synapses(
                        segment,
                        prev_winner_cells,
                        self.max_new_synapse_count as usize,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Picks the matching segment with the highest potential-synapse count;
    /// ties go to the lowest flat index.
    fn best_matching_segment(&self, column_matching_segments: &[Segment]) -> Option<Segment> {
        let mut best: Option<(Segment, UInt)> = None;

        for &segment in column_matching_segments {
            let count = self.active_potential(segment) as UInt;
            best = match best {
                None => Some((segment, count)),
                Some((best_segment, best_count)) => {
                    if count > best_count || (count == best_count && segment < best_segment) {
                        Some((segment, count))
                    } else {
                        Some((best_segment, best_count))
                    }
                }
            };
        }

        best.map(|(segment, _)| segment)
    }

    /// Returns the cell with the fewest segments in a column, breaking ties
    /// uniformly at random.
    fn least_used_cell(&mut self, column: UInt) -> CellIdx {
        let first_cell = column * self.cells_per_column;
        let last_cell = first_cell + self.cells_per_column;

        let mut min_segments = usize::MAX;
        let mut num_tied = 0u32;
        for cell in first_cell..last_cell {
            let count = self.connections.num_segments_on_cell(cell);
            if count < min_segments {
                min_segments = count;
                num_tied = 1;
            } else if count == min_segments {
                num_tied += 1;
            }
        }

        let winner_index = self.rng.get_uint32_range(0, num_tied);
        let mut tie_index = 0;
        for cell in first_cell..last_cell {
            if self.connections.num_segments_on_cell(cell) == min_segments {
                if tie_index == winner_index {
                    return cell;
                }
                tie_index += 1;
            }
        }

        last_cell - 1
    }

    /// Reinforces synapses to previously active cells by `increment` and
    /// weakens the rest by `decrement`. Synapses driven to zero or below are
    /// destroyed; a segment left empty is destroyed as well.
    ///
    /// Returns whether the segment still exists.
    fn adapt_segment(
        &mut self,
        segment: Segment,
        prev_active_cells: &[CellIdx],
        increment: Permanence,
        decrement: Permanence,
    ) -> Result<bool> {
        let mut index = 0;
        while index < self.connections.num_synapses_on_segment(segment) {
            let synapse = self.connections.synapses_for_segment(segment)[index];
            let synapse_data = self.connections.data_for_synapse(synapse);

            // `prev_active_cells` is ascending by construction.
            let delta = if prev_active_cells
                .binary_search(&synapse_data.presynaptic_cell)
                .is_ok()
            {
                increment
            } else {
                -decrement
            };

            let permanence = synapse_data.permanence + delta;
            if permanence <= MIN_PERMANENCE {
                self.connections.destroy_synapse(synapse)?;
            } else {
                self.connections
                    .update_synapse_permanence(synapse, permanence.min(MAX_PERMANENCE))?;
                index += 1;
            }
        }

        if self.connections.num_synapses_on_segment(segment) == 0 {
            self.connections.destroy_segment(segment)?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Grows up to `n_desired` synapses from the segment to previous winner
    /// cells that are not already presynaptic on it. When the request covers
    /// the whole pool every candidate is grown; otherwise the pool is sampled
    /// without replacement.
    fn grow_synapses(
        &mut self,
        segment: Segment,
        prev_winner_cells: &[CellIdx],
        n_desired: usize,
    ) -> Result<()> {
        if n_desired == 0 || prev_winner_cells.is_empty() {
            return Ok(());
        }

        let existing = self.connections.presynaptic_cells_for_segment(segment);
        let mut candidates: Vec<CellIdx> = prev_winner_cells
            .iter()
            .copied()
            .filter(|cell| !existing.contains(cell))
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }

        if n_desired < candidates.len() {
            candidates = self.rng.sample(candidates, n_desired);
        }

        for cell in candidates {
            self.connections
                .create_synapse(segment, cell, self.initial_permanence)?;
        }
        Ok(())
    }

    /// Depolarization phase: recomputes segment activity from the new active
    /// cells and derives the prediction for the next step.
    fn activate_dendrites(&mut self) {
        let (num_active_connected, num_active_potential) = self
            .connections
            .compute_activity(&self.active_cells, self.connected_permanence);

        self.active_segments.clear();
        self.matching_segments.clear();
        for flat_idx in 0..num_active_connected.len() {
            if num_active_connected[flat_idx] >= self.activation_threshold {
                self.active_segments.push(flat_idx as Segment);
            }
            if num_active_potential[flat_idx] >= self.min_threshold {
                self.matching_segments.push(flat_idx as Segment);
            }
        }

        let connections = &self.connections;
        self.active_segments
            .sort_unstable_by(|&a, &b| connections.compare_segments(a, b));
        self.matching_segments
            .sort_unstable_by(|&a, &b| connections.compare_segments(a, b));

        self.predictive_cells.clear();
        for &segment in &self.active_segments {
            let cell = connections.cell_for_segment(segment);
            if self.predictive_cells.last() != Some(&cell) {
                self.predictive_cells.push(cell);
            }
        }

        self.num_active_connected_synapses_for_segment = num_active_connected;
        self.num_active_potential_synapses_for_segment = num_active_potential;
    }

    fn active_potential(&self, segment: Segment) -> usize {
        self.num_active_potential_synapses_for_segment
            .get(segment as usize)
            .copied()
            .unwrap_or(0) as usize
    }

    /// Clears all per-timestep state. Connectivity and the iteration counter
    /// are untouched.
    pub fn reset(&mut self) {
        self.prev_active_cells.clear();
        self.active_cells.clear();
        self.prev_winner_cells.clear();
        self.winner_cells.clear();
        self.predictive_cells.clear();
        self.active_segments.clear();
        self.matching_segments.clear();
        self.num_active_connected_synapses_for_segment.clear();
        self.num_active_potential_synapses_for_segment.clear();
    }

    // ========================================================================
    // Cell/Column utilities
    // ========================================================================

    #[inline]
    fn column_of_cell(&self, cell: CellIdx) -> UInt {
        cell / self.cells_per_column
    }

    /// Returns the column that contains `cell`.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::InvalidArgument`] if the cell is out of range.
    pub fn column_for_cell(&self, cell: CellIdx) -> Result<UInt> {
        if cell as usize >= self.num_cells {
            return Err(VelesError::InvalidArgument(format!(
                "cell {} out of range ({} cells)",
                cell, self.num_cells
            )));
        }
        Ok(self.column_of_cell(cell))
    }

    // ========================================================================
    // Getters
    // ========================================================================

    /// Returns the column dimensions.
    pub fn column_dimensions(&self) -> &[UInt] {
        &self.column_dimensions
    }

    /// Returns the number of columns.
    pub fn number_of_columns(&self) -> usize {
        self.num_columns
    }

    /// Returns the number of cells per column.
    pub fn cells_per_column(&self) -> UInt {
        self.cells_per_column
    }

    /// Returns the total number of cells.
    pub fn number_of_cells(&self) -> usize {
        self.num_cells
    }

    /// Returns the activation threshold.
    pub fn activation_threshold(&self) -> UInt {
        self.activation_threshold
    }

    /// Returns the initial permanence of grown synapses.
    pub fn initial_permanence(&self) -> Permanence {
        self.initial_permanence
    }

    /// Returns the connected permanence threshold.
    pub fn connected_permanence(&self) -> Permanence {
        self.connected_permanence
    }

    /// Returns the matching threshold.
    pub fn min_threshold(&self) -> UInt {
        self.min_threshold
    }

    /// Returns the target fan-in for synapse growth.
    pub fn max_new_synapse_count(&self) -> UInt {
        self.max_new_synapse_count
    }

    /// Returns the permanence increment.
    pub fn permanence_increment(&self) -> Permanence {
        self.permanence_increment
    }

    /// Returns the permanence decrement.
    pub fn permanence_decrement(&self) -> Permanence {
        self.permanence_decrement
    }

    /// Returns the penalty applied to wrongly predicting segments.
    pub fn predicted_segment_decrement(&self) -> Permanence {
        self.predicted_segment_decrement
    }

    /// Returns the maximum number of segments per cell.
    pub fn max_segments_per_cell(&self) -> UInt {
        self.max_segments_per_cell
    }

    /// Returns the maximum number of synapses per segment.
    pub fn max_synapses_per_segment(&self) -> UInt {
        self.max_synapses_per_segment
    }

    /// Returns the cells active in the current timestep, ascending.
    pub fn active_cells(&self) -> &[CellIdx] {
        &self.active_cells
    }

    /// Returns the winner cells of the current timestep, ascending.
    pub fn winner_cells(&self) -> &[CellIdx] {
        &self.winner_cells
    }

    /// Returns the cells active in the previous timestep.
    pub fn previous_active_cells(&self) -> &[CellIdx] {
        &self.prev_active_cells
    }

    /// Returns the winner cells of the previous timestep.
    pub fn previous_winner_cells(&self) -> &[CellIdx] {
        &self.prev_winner_cells
    }

    /// Returns the cells predicted to activate in the next timestep.
    pub fn predictive_cells(&self) -> &[CellIdx] {
        &self.predictive_cells
    }

    /// Returns the active segments, sorted by owning cell and position.
    pub fn active_segments(&self) -> &[Segment] {
        &self.active_segments
    }

    /// Returns the matching segments, sorted by owning cell and position.
    pub fn matching_segments(&self) -> &[Segment] {
        &self.matching_segments
    }

    /// Returns the number of active connected synapses counted for a segment
    /// during the last depolarization.
    pub fn num_active_connected_synapses_for_segment(&self, segment: Segment) -> UInt {
        self.num_active_connected_synapses_for_segment
            .get(segment as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Returns the number of active potential synapses counted for a segment
    /// during the last depolarization.
    pub fn num_active_potential_synapses_for_segment(&self, segment: Segment) -> UInt {
        self.num_active_potential_synapses_for_segment
            .get(segment as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Returns a reference to the underlying connections graph.
    pub fn connections(&self) -> &Connections {
        &self.connections
    }

    /// Returns a mutable reference to the underlying connections graph.
    ///
    /// Mutating the graph between computes is primarily useful for seeding
    /// connectivity in tests; the next depolarization folds any changes into
    /// the segment state.
    pub fn connections_mut(&mut self) -> &mut Connections {
        &mut self.connections
    }

    /// Returns the learning iteration counter.
    pub fn iteration(&self) -> Iteration {
        self.connections.iteration()
    }

    // ========================================================================
    // Serialization
    // ========================================================================

    /// Writes the full state in the whitespace-separated text format: the
    /// configuration, the RNG state, previous and current cell sets, the
    /// segment lists encoded by `(cell, idx_on_cell)`, and the nested
    /// connections graph.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::IoError`] if the stream cannot be written.
    pub fn save<W: Write>(&self, stream: &mut W) -> Result<()> {
        writeln!(stream, "TemporalMemory")?;
        writeln!(stream, "{}", Self::VERSION)?;

        write!(stream, "{} ", self.column_dimensions.len())?;
        for &dimension in &self.column_dimensions {
            write!(stream, "{dimension} ")?;
        }
        writeln!(stream)?;

        writeln!(
            stream,
            "{} {} {} {}",
            self.cells_per_column,
            self.activation_threshold,
            self.min_threshold,
            self.max_new_synapse_count
        )?;
        writeln!(
            stream,
            "{} {} {} {} {}",
            self.initial_permanence,
            self.connected_permanence,
            self.permanence_increment,
            self.permanence_decrement,
            self.predicted_segment_decrement
        )?;
        writeln!(
            stream,
            "{} {}",
            self.max_segments_per_cell, self.max_synapses_per_segment
        )?;
        writeln!(stream, "{} {}", self.rng.seed(), self.rng.steps())?;

        write_cell_list(stream, &self.prev_active_cells)?;
        write_cell_list(stream, &self.active_cells)?;
        write_cell_list(stream, &self.prev_winner_cells)?;
        write_cell_list(stream, &self.winner_cells)?;

        self.write_segment_list(stream, &self.active_segments)?;
        self.write_segment_list(stream, &self.matching_segments)?;

        self.connections.save(stream)?;

        writeln!(stream, "~TemporalMemory")?;
        Ok(())
    }

    fn write_segment_list<W: Write>(&self, stream: &mut W, segments: &[Segment]) -> Result<()> {
        write!(stream, "{} ", segments.len())?;
        for &segment in segments {
            let segment_data = self.connections.data_for_segment(segment);
            write!(stream, "{} {} ", segment_data.cell, segment_data.idx_on_cell)?;
        }
        writeln!(stream)?;
        Ok(())
    }

    /// Reads the full state from the text format. The per-segment activity
    /// counts are re-derived from the restored active cells.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::FormatError`] for malformed streams,
    /// [`VelesError::InvalidState`] for streams written by a newer version,
    /// and [`VelesError::InvalidArgument`] for invalid configurations.
    pub fn load<R: Read>(stream: R) -> Result<Self> {
        let mut reader = TokenReader::new(BufReader::new(stream));

        reader.expect_marker("TemporalMemory")?;
        let version: UInt = reader.parse()?;
        if version > Self::VERSION {
            return Err(VelesError::InvalidState(format!(
                "stream version {} is newer than supported version {}",
                version,
                Self::VERSION
            )));
        }

        let num_dimensions: usize = reader.parse()?;
        let mut column_dimensions = Vec::with_capacity(num_dimensions);
        for _ in 0..num_dimensions {
            column_dimensions.push(reader.parse()?);
        }

        let cells_per_column: UInt = reader.parse()?;
        let activation_threshold: UInt = reader.parse()?;
        let min_threshold: UInt = reader.parse()?;
        let max_new_synapse_count: UInt = reader.parse()?;
        let initial_permanence: Permanence = reader.parse()?;
        let connected_permanence: Permanence = reader.parse()?;
        let permanence_increment: Permanence = reader.parse()?;
        let permanence_decrement: Permanence = reader.parse()?;
        let predicted_segment_decrement: Permanence = reader.parse()?;
        let max_segments_per_cell: UInt = reader.parse()?;
        let max_synapses_per_segment: UInt = reader.parse()?;

        let rng_seed: u64 = reader.parse()?;
        let rng_steps: u64 = reader.parse()?;

        let prev_active_cells = read_cell_list(&mut reader)?;
        let active_cells = read_cell_list(&mut reader)?;
        let prev_winner_cells = read_cell_list(&mut reader)?;
        let winner_cells = read_cell_list(&mut reader)?;

        let active_segment_refs = read_segment_list(&mut reader)?;
        let matching_segment_refs = read_segment_list(&mut reader)?;

        let connections = Connections::load_tokens(&mut reader)?;
        reader.expect_marker("~TemporalMemory")?;

        Self::from_parts(
            TemporalMemoryParams {
                column_dimensions,
                cells_per_column,
                activation_threshold,
                initial_permanence,
                connected_permanence,
                min_threshold,
                max_new_synapse_count,
                permanence_increment,
                permanence_decrement,
                predicted_segment_decrement,
                seed: 0,
                max_segments_per_cell,
                max_synapses_per_segment,
            },
            connections,
            Random::from_state(rng_seed, rng_steps),
            prev_active_cells,
            active_cells,
            prev_winner_cells,
            winner_cells,
            active_segment_refs,
            matching_segment_refs,
        )
    }

    /// Rebuilds an instance from deserialized parts, resolving segment
    /// references and re-deriving the activity counts and predictive cells.
    #[allow(clippy::too_many_arguments)]
    fn from_parts(
        params: TemporalMemoryParams,
        connections: Connections,
        rng: Random,
        prev_active_cells: Vec<CellIdx>,
        active_cells: Vec<CellIdx>,
        prev_winner_cells: Vec<CellIdx>,
        winner_cells: Vec<CellIdx>,
        active_segment_refs: Vec<(CellIdx, SegmentIdx)>,
        matching_segment_refs: Vec<(CellIdx, SegmentIdx)>,
    ) -> Result<Self> {
        let mut tm = Self::new(params)?;

        if connections.num_cells() != tm.num_cells {
            return Err(VelesError::FormatError(format!(
                "connections hold {} cells but the configuration implies {}",
                connections.num_cells(),
                tm.num_cells
            )));
        }
        tm.connections = connections;
        tm.rng = rng;

        for list in [
            &prev_active_cells,
            &active_cells,
            &prev_winner_cells,
            &winner_cells,
        ] {
            for &cell in list.iter() {
                if cell as usize >= tm.num_cells {
                    return Err(VelesError::FormatError(format!(
                        "cell {cell} out of range"
                    )));
                }
            }
        }

        tm.active_segments = tm.resolve_segment_refs(&active_segment_refs)?;
        tm.matching_segments = tm.resolve_segment_refs(&matching_segment_refs)?;

        tm.prev_active_cells = prev_active_cells;
        tm.active_cells = active_cells;
        tm.prev_winner_cells = prev_winner_cells;
        tm.winner_cells = winner_cells;

        let (num_active_connected, num_active_potential) = tm
            .connections
            .compute_activity(&tm.active_cells, tm.connected_permanence);
        tm.num_active_connected_synapses_for_segment = num_active_connected;
        tm.num_active_potential_synapses_for_segment = num_active_potential;

        tm.predictive_cells.clear();
        for &segment in &tm.active_segments {
            let cell = tm.connections.cell_for_segment(segment);
            if tm.predictive_cells.last() != Some(&cell) {
                tm.predictive_cells.push(cell);
            }
        }

        Ok(tm)
    }

    fn resolve_segment_refs(&self, refs: &[(CellIdx, SegmentIdx)]) -> Result<Vec<Segment>> {
        refs.iter()
            .map(|&(cell, idx_on_cell)| {
                if cell as usize >= self.num_cells {
                    return Err(VelesError::FormatError(format!(
                        "cell {cell} out of range"
                    )));
                }
                self.connections
                    .segments_for_cell(cell)
                    .get(idx_on_cell as usize)
                    .copied()
                    .ok_or_else(|| {
                        VelesError::FormatError(format!(
                            "cell {cell} has no segment at position {idx_on_cell}"
                        ))
                    })
            })
            .collect()
    }
}

fn write_cell_list<W: Write>(stream: &mut W, cells: &[CellIdx]) -> Result<()> {
    write!(stream, "{} ", cells.len())?;
    for &cell in cells {
        write!(stream, "{cell} ")?;
    }
    writeln!(stream)?;
    Ok(())
}

fn read_cell_list<R: Read>(reader: &mut TokenReader<R>) -> Result<Vec<CellIdx>> {
    let len: usize = reader.parse()?;
    let mut cells = Vec::with_capacity(len);
    for _ in 0..len {
        cells.push(reader.parse()?);
    }
    Ok(cells)
}

fn read_segment_list<R: Read>(reader: &mut TokenReader<R>) -> Result<Vec<(CellIdx, SegmentIdx)>> {
    let len: usize = reader.parse()?;
    let mut segments = Vec::with_capacity(len);
    for _ in 0..len {
        let cell: CellIdx = reader.parse()?;
        let idx_on_cell: SegmentIdx = reader.parse()?;
        segments.push((cell, idx_on_cell));
    }
    Ok(segments)
}

#[cfg(feature = "serde")]
mod serde_impl {
    //! Envelope serialization: the snapshot carries the configuration, the
    //! RNG state, previous/current cell sets, and the segment lists as
    //! `(cell, idx_on_cell)` pairs; the activity counts are re-derived on
    //! load.

    use super::{TemporalMemory, TemporalMemoryParams};
    use crate::algorithms::Connections;
    use crate::error::VelesError;
    use crate::types::{CellIdx, Permanence, SegmentIdx, UInt};
    use crate::utils::Random;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct TemporalMemoryState {
        version: UInt,
        column_dimensions: Vec<UInt>,
        cells_per_column: UInt,
        activation_threshold: UInt,
        initial_permanence: Permanence,
        connected_permanence: Permanence,
        min_threshold: UInt,
        max_new_synapse_count: UInt,
        permanence_increment: Permanence,
        permanence_decrement: Permanence,
        predicted_segment_decrement: Permanence,
        max_segments_per_cell: UInt,
        max_synapses_per_segment: UInt,
        connections: Connections,
        rng_seed: u64,
        rng_steps: u64,
        prev_active_cells: Vec<CellIdx>,
        active_cells: Vec<CellIdx>,
        prev_winner_cells: Vec<CellIdx>,
        winner_cells: Vec<CellIdx>,
        active_segments: Vec<(CellIdx, SegmentIdx)>,
        matching_segments: Vec<(CellIdx, SegmentIdx)>,
    }

    impl From<&TemporalMemory> for TemporalMemoryState {
        fn from(tm: &TemporalMemory) -> Self {
            let segment_refs = |segments: &[crate::types::Segment]| {
                segments
                    .iter()
                    .map(|&segment| {
                        let segment_data = tm.connections.data_for_segment(segment);
                        (segment_data.cell, segment_data.idx_on_cell)
                    })
                    .collect()
            };

            Self {
                version: TemporalMemory::VERSION,
                column_dimensions: tm.column_dimensions.clone(),
                cells_per_column: tm.cells_per_column,
                activation_threshold: tm.activation_threshold,
                initial_permanence: tm.initial_permanence,
                connected_permanence: tm.connected_permanence,
                min_threshold: tm.min_threshold,
                max_new_synapse_count: tm.max_new_synapse_count,
                permanence_increment: tm.permanence_increment,
                permanence_decrement: tm.permanence_decrement,
                predicted_segment_decrement: tm.predicted_segment_decrement,
                max_segments_per_cell: tm.max_segments_per_cell,
                max_synapses_per_segment: tm.max_synapses_per_segment,
                connections: tm.connections.clone(),
                rng_seed: tm.rng.seed(),
                rng_steps: tm.rng.steps(),
                prev_active_cells: tm.prev_active_cells.clone(),
                active_cells: tm.active_cells.clone(),
                prev_winner_cells: tm.prev_winner_cells.clone(),
                winner_cells: tm.winner_cells.clone(),
                active_segments: segment_refs(&tm.active_segments),
                matching_segments: segment_refs(&tm.matching_segments),
            }
        }
    }

    impl TryFrom<TemporalMemoryState> for TemporalMemory {
        type Error = VelesError;

        fn try_from(state: TemporalMemoryState) -> Result<Self, VelesError> {
            if state.version > TemporalMemory::VERSION {
                return Err(VelesError::InvalidState(format!(
                    "stream version {} is newer than supported version {}",
                    state.version,
                    TemporalMemory::VERSION
                )));
            }

            TemporalMemory::from_parts(
                TemporalMemoryParams {
                    column_dimensions: state.column_dimensions,
                    cells_per_column: state.cells_per_column,
                    activation_threshold: state.activation_threshold,
                    initial_permanence: state.initial_permanence,
                    connected_permanence: state.connected_permanence,
                    min_threshold: state.min_threshold,
                    max_new_synapse_count: state.max_new_synapse_count,
                    permanence_increment: state.permanence_increment,
                    permanence_decrement: state.permanence_decrement,
                    predicted_segment_decrement: state.predicted_segment_decrement,
                    seed: 0,
                    max_segments_per_cell: state.max_segments_per_cell,
                    max_synapses_per_segment: state.max_synapses_per_segment,
                },
                state.connections,
                Random::from_state(state.rng_seed, state.rng_steps),
                state.prev_active_cells,
                state.active_cells,
                state.prev_winner_cells,
                state.winner_cells,
                state.active_segments,
                state.matching_segments,
            )
        }
    }

    impl Serialize for TemporalMemory {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            TemporalMemoryState::from(self).serialize(serializer)
        }
    }

    impl<'de> Deserialize<'de> for TemporalMemory {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            let state = TemporalMemoryState::deserialize(deserializer)?;
            TemporalMemory::try_from(state).map_err(serde::de::Error::custom)
        }
    }
}
