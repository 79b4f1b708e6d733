//! Connections - the synaptic connectivity graph for temporal memory.
//!
//! The Connections struct records distal dendritic connectivity between cells:
//! each cell owns an ordered list of segments, each segment owns an ordered
//! list of synapses, and a reverse index maps presynaptic cells to the
//! synapses they drive. Identifiers are dense flat indices that are recycled
//! through free-lists, so back-references are plain indices rather than
//! pointers.

use crate::error::{Result, VelesError};
use crate::types::{
    CellIdx, Iteration, Permanence, Segment, SegmentIdx, Synapse, SynapseIdx, UInt, UInt32,
    EPSILON,
};

use ahash::AHashMap;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::io::{BufReader, Read, Write};
use std::str::FromStr;

/// Data associated with a synapse.
#[derive(Debug, Clone, PartialEq)]
pub struct SynapseData {
    /// The presynaptic cell this synapse connects to.
    pub presynaptic_cell: CellIdx,

    /// The permanence strength of this synapse.
    pub permanence: Permanence,

    /// The segment this synapse belongs to.
    pub segment: Segment,

    /// Position of this synapse in its segment's synapse list.
    pub idx_on_segment: SynapseIdx,
}

/// Data associated with a segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentData {
    /// The synapses on this segment, in creation order.
    pub synapses: SmallVec<[Synapse; 32]>,

    /// The cell this segment belongs to.
    pub cell: CellIdx,

    /// Position of this segment in its cell's segment list.
    pub idx_on_cell: SegmentIdx,

    /// Iteration at which this segment last participated in learning.
    pub last_used_iteration: Iteration,
}

/// Data associated with a cell.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellData {
    /// The segments on this cell, in creation order.
    pub segments: SmallVec<[Segment; 8]>,
}

/// Receiver for change notifications from a [`Connections`] instance.
///
/// All methods have default no-op implementations, so a subscriber only
/// overrides the events it cares about. Handlers are invoked synchronously,
/// before the triggering operation returns.
pub trait ConnectionsEventHandler {
    /// Called when a segment has been created.
    fn on_create_segment(&mut self, _segment: Segment) {}

    /// Called before a segment is destroyed.
    fn on_destroy_segment(&mut self, _segment: Segment) {}

    /// Called when a synapse has been created.
    fn on_create_synapse(&mut self, _synapse: Synapse) {}

    /// Called before a synapse is destroyed.
    fn on_destroy_synapse(&mut self, _synapse: Synapse) {}

    /// Called before a synapse's permanence is updated, whether or not the
    /// value changes.
    fn on_update_synapse_permanence(&mut self, _synapse: Synapse, _permanence: Permanence) {}
}

/// Parameters for creating a Connections instance.
#[derive(Debug, Clone)]
pub struct ConnectionsParams {
    /// Number of cells in the connections graph.
    pub num_cells: CellIdx,

    /// Maximum number of segments a cell may hold before the least recently
    /// used segment is evicted.
    pub max_segments_per_cell: SegmentIdx,

    /// Maximum number of synapses a segment may hold before the weakest
    /// synapse is evicted.
    pub max_synapses_per_segment: SynapseIdx,
}

impl Default for ConnectionsParams {
    fn default() -> Self {
        Self {
            num_cells: 0,
            max_segments_per_cell: 255,
            max_synapses_per_segment: 255,
        }
    }
}

/// The synaptic connectivity graph.
///
/// Segments and synapses live by value in flat arrays keyed by their dense
/// identifiers; destroyed identifiers are kept on per-kind free-lists and
/// reused in LIFO order. Cells hold only indices into the segment array, and
/// the reverse presynaptic index is maintained eagerly on every mutation.
pub struct Connections {
    /// All cells in the graph.
    cells: Vec<CellData>,

    /// All segments, keyed by flat index (including destroyed slots).
    segments: Vec<SegmentData>,

    /// Destroyed segment indices, reused LIFO.
    destroyed_segments: Vec<Segment>,

    /// All synapses, keyed by flat index (including destroyed slots).
    synapses: Vec<SynapseData>,

    /// Destroyed synapse indices, reused LIFO.
    destroyed_synapses: Vec<Synapse>,

    /// Segment capacity per cell.
    max_segments_per_cell: SegmentIdx,

    /// Synapse capacity per segment.
    max_synapses_per_segment: SynapseIdx,

    /// Iteration counter, advanced by [`Connections::start_new_iteration`].
    iteration: Iteration,

    /// Maps presynaptic cell -> synapses driven by it. Buckets are removed
    /// when they become empty.
    synapses_for_presynaptic_cell: AHashMap<CellIdx, Vec<Synapse>>,

    /// Token handed out by the next `subscribe` call.
    next_event_token: UInt32,

    /// Subscribed event handlers, keyed by token in issue order.
    event_handlers: BTreeMap<UInt32, Box<dyn ConnectionsEventHandler>>,
}

impl Connections {
    /// Current version of both serialized formats.
    pub const VERSION: UInt = 2;

    /// Creates a new Connections instance with the given parameters.
    pub fn new(params: ConnectionsParams) -> Self {
        Self {
            cells: vec![CellData::default(); params.num_cells as usize],
            segments: Vec::new(),
            destroyed_segments: Vec::new(),
            synapses: Vec::new(),
            destroyed_synapses: Vec::new(),
            max_segments_per_cell: params.max_segments_per_cell,
            max_synapses_per_segment: params.max_synapses_per_segment,
            iteration: 0,
            synapses_for_presynaptic_cell: AHashMap::new(),
            next_event_token: 0,
            event_handlers: BTreeMap::new(),
        }
    }

    /// Creates a Connections instance with default capacity limits.
    pub fn with_cells(num_cells: CellIdx) -> Self {
        Self::new(ConnectionsParams {
            num_cells,
            ..Default::default()
        })
    }

    /// Returns the number of cells.
    #[inline]
    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    /// Returns the segment capacity per cell.
    #[inline]
    pub fn max_segments_per_cell(&self) -> SegmentIdx {
        self.max_segments_per_cell
    }

    /// Returns the synapse capacity per segment.
    #[inline]
    pub fn max_synapses_per_segment(&self) -> SynapseIdx {
        self.max_synapses_per_segment
    }

    /// Returns the current iteration count.
    #[inline]
    pub fn iteration(&self) -> Iteration {
        self.iteration
    }

    /// Returns the number of live segments.
    pub fn num_segments(&self) -> usize {
        self.segments.len() - self.destroyed_segments.len()
    }

    /// Returns the number of segments on a specific cell.
    pub fn num_segments_on_cell(&self, cell: CellIdx) -> usize {
        self.cells[cell as usize].segments.len()
    }

    /// Returns the number of live synapses.
    pub fn num_synapses(&self) -> usize {
        self.synapses.len() - self.destroyed_synapses.len()
    }

    /// Returns the number of synapses on a specific segment.
    pub fn num_synapses_on_segment(&self, segment: Segment) -> usize {
        self.segments[segment as usize].synapses.len()
    }

    /// Returns the length of the flat segment list, including destroyed
    /// slots. Activity vectors are indexed by flat segment id, so they have
    /// this length.
    pub fn segment_flat_list_length(&self) -> usize {
        self.segments.len()
    }

    // ========================================================================
    // Event subscription
    // ========================================================================

    /// Registers an event handler and returns a token for unregistration.
    pub fn subscribe(&mut self, handler: Box<dyn ConnectionsEventHandler>) -> UInt32 {
        let token = self.next_event_token;
        self.next_event_token += 1;
        self.event_handlers.insert(token, handler);
        token
    }

    /// Unregisters the event handler associated with `token`, dropping it.
    /// Unknown tokens are ignored.
    pub fn unsubscribe(&mut self, token: UInt32) {
        self.event_handlers.remove(&token);
    }

    fn notify<F>(&mut self, mut notify_fn: F)
    where
        F: FnMut(&mut dyn ConnectionsEventHandler),
    {
        if self.event_handlers.is_empty() {
            return;
        }
        // Handlers are moved out so they can be called while the graph is
        // borrowed mutably; they never get access to the graph itself.
        let mut handlers = std::mem::take(&mut self.event_handlers);
        for handler in handlers.values_mut() {
            notify_fn(handler.as_mut());
        }
        self.event_handlers = handlers;
    }

    // ========================================================================
    // Segment operations
    // ========================================================================

    /// Creates a new segment on the specified cell.
    ///
    /// If the cell is at its segment capacity, the least recently used
    /// segment on that cell is destroyed first. The new segment reuses a
    /// freed flat index when one is available.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::InvalidArgument`] if the cell is out of range or
    /// the graph was configured with a segment capacity of zero.
    pub fn create_segment(&mut self, cell: CellIdx) -> Result<Segment> {
        if self.max_segments_per_cell == 0 {
            return Err(VelesError::InvalidArgument(
                "cannot create segments with max_segments_per_cell of 0".into(),
            ));
        }
        if cell as usize >= self.cells.len() {
            return Err(VelesError::InvalidArgument(format!(
                "cell {} out of range ({} cells)",
                cell,
                self.cells.len()
            )));
        }

        while self.cells[cell as usize].segments.len() >= self.max_segments_per_cell as usize {
            match self.least_recently_used_segment(cell) {
                Some(stale) => self.destroy_segment(stale)?,
                None => break,
            }
        }

        let segment = match self.destroyed_segments.pop() {
            Some(reused) => {
                self.segments[reused as usize] = SegmentData {
                    synapses: SmallVec::new(),
                    cell,
                    idx_on_cell: 0,
                    last_used_iteration: self.iteration,
                };
                reused
            }
            None => {
                let segment = self.segments.len() as Segment;
                self.segments.push(SegmentData {
                    synapses: SmallVec::new(),
                    cell,
                    idx_on_cell: 0,
                    last_used_iteration: self.iteration,
                });
                segment
            }
        };

        let cell_data = &mut self.cells[cell as usize];
        self.segments[segment as usize].idx_on_cell = cell_data.segments.len() as SegmentIdx;
        cell_data.segments.push(segment);

        self.notify(|handler| handler.on_create_segment(segment));

        Ok(segment)
    }

    /// Destroys a segment and all synapses on it.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::InvalidArgument`] if the segment does not exist.
    pub fn destroy_segment(&mut self, segment: Segment) -> Result<()> {
        if !self.segment_exists(segment) {
            return Err(VelesError::InvalidArgument(format!(
                "segment {segment} does not exist"
            )));
        }

        self.notify(|handler| handler.on_destroy_segment(segment));

        // The segment's synapse list is dropped wholesale, so there is no
        // per-synapse index shifting to do here.
        let synapses = std::mem::take(&mut self.segments[segment as usize].synapses);
        for synapse in synapses {
            self.remove_synapse_from_presynaptic_map(synapse);
            self.destroyed_synapses.push(synapse);
        }

        let (cell, idx_on_cell) = {
            let segment_data = &self.segments[segment as usize];
            (segment_data.cell, segment_data.idx_on_cell as usize)
        };

        self.cells[cell as usize].segments.remove(idx_on_cell);
        for position in idx_on_cell..self.cells[cell as usize].segments.len() {
            let shifted = self.cells[cell as usize].segments[position];
            self.segments[shifted as usize].idx_on_cell = position as SegmentIdx;
        }

        self.destroyed_segments.push(segment);
        Ok(())
    }

    /// Records that a segment participated in the current iteration.
    pub fn record_segment_activity(&mut self, segment: Segment) {
        self.segments[segment as usize].last_used_iteration = self.iteration;
    }

    /// Advances the iteration counter.
    pub fn start_new_iteration(&mut self) {
        self.iteration += 1;
    }

    fn least_recently_used_segment(&self, cell: CellIdx) -> Option<Segment> {
        // Ties go to the first segment in the cell's list.
        self.cells[cell as usize]
            .segments
            .iter()
            .copied()
            .min_by_key(|&segment| self.segments[segment as usize].last_used_iteration)
    }

    fn segment_exists(&self, segment: Segment) -> bool {
        match self.segments.get(segment as usize) {
            Some(segment_data) => self.cells[segment_data.cell as usize]
                .segments
                .contains(&segment),
            None => false,
        }
    }

    // ========================================================================
    // Synapse operations
    // ========================================================================

    /// Creates a new synapse on a segment.
    ///
    /// If the segment is at its synapse capacity, the synapse with the lowest
    /// permanence is destroyed first. The new synapse reuses a freed flat
    /// index when one is available. A segment may hold multiple synapses to
    /// the same presynaptic cell; deduplication is the caller's concern.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::InvalidArgument`] if the segment does not exist,
    /// the presynaptic cell is out of range, the permanence is not strictly
    /// positive, or the graph was configured with a synapse capacity of zero.
    pub fn create_synapse(
        &mut self,
        segment: Segment,
        presynaptic_cell: CellIdx,
        permanence: Permanence,
    ) -> Result<Synapse> {
        if self.max_synapses_per_segment == 0 {
            return Err(VelesError::InvalidArgument(
                "cannot create synapses with max_synapses_per_segment of 0".into(),
            ));
        }
        if !self.segment_exists(segment) {
            return Err(VelesError::InvalidArgument(format!(
                "segment {segment} does not exist"
            )));
        }
        if presynaptic_cell as usize >= self.cells.len() {
            return Err(VelesError::InvalidArgument(format!(
                "presynaptic cell {} out of range ({} cells)",
                presynaptic_cell,
                self.cells.len()
            )));
        }
        if permanence <= 0.0 {
            return Err(VelesError::InvalidArgument(format!(
                "synapse permanence must be positive, got {permanence}"
            )));
        }

        while self.segments[segment as usize].synapses.len()
            >= self.max_synapses_per_segment as usize
        {
            match self.min_permanence_synapse(segment) {
                Some(weakest) => self.destroy_synapse(weakest)?,
                None => break,
            }
        }

        let synapse_data = SynapseData {
            presynaptic_cell,
            permanence,
            segment,
            idx_on_segment: 0,
        };
        let synapse = match self.destroyed_synapses.pop() {
            Some(reused) => {
                self.synapses[reused as usize] = synapse_data;
                reused
            }
            None => {
                let synapse = self.synapses.len() as Synapse;
                self.synapses.push(synapse_data);
                synapse
            }
        };

        let segment_data = &mut self.segments[segment as usize];
        self.synapses[synapse as usize].idx_on_segment =
            segment_data.synapses.len() as SynapseIdx;
        segment_data.synapses.push(synapse);

        self.synapses_for_presynaptic_cell
            .entry(presynaptic_cell)
            .or_default()
            .push(synapse);

        self.notify(|handler| handler.on_create_synapse(synapse));

        Ok(synapse)
    }

    /// Destroys a synapse.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::InvalidArgument`] if the synapse does not exist.
    pub fn destroy_synapse(&mut self, synapse: Synapse) -> Result<()> {
        if !self.synapse_exists(synapse) {
            return Err(VelesError::InvalidArgument(format!(
                "synapse {synapse} does not exist"
            )));
        }

        self.notify(|handler| handler.on_destroy_synapse(synapse));

        self.remove_synapse_from_presynaptic_map(synapse);

        let (segment, idx_on_segment) = {
            let synapse_data = &self.synapses[synapse as usize];
            (synapse_data.segment, synapse_data.idx_on_segment as usize)
        };

        self.segments[segment as usize].synapses.remove(idx_on_segment);
        for position in idx_on_segment..self.segments[segment as usize].synapses.len() {
            let shifted = self.segments[segment as usize].synapses[position];
            self.synapses[shifted as usize].idx_on_segment = position as SynapseIdx;
        }

        self.destroyed_synapses.push(synapse);
        Ok(())
    }

    /// Updates a synapse's permanence value.
    ///
    /// Subscribers are notified even when the new value equals the old one.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::InvalidArgument`] if the synapse does not exist
    /// or the permanence is not strictly positive; callers destroy synapses
    /// rather than zeroing them.
    pub fn update_synapse_permanence(
        &mut self,
        synapse: Synapse,
        permanence: Permanence,
    ) -> Result<()> {
        if !self.synapse_exists(synapse) {
            return Err(VelesError::InvalidArgument(format!(
                "synapse {synapse} does not exist"
            )));
        }
        if permanence <= 0.0 {
            return Err(VelesError::InvalidArgument(format!(
                "synapse permanence must be positive, got {permanence}"
            )));
        }

        self.notify(|handler| handler.on_update_synapse_permanence(synapse, permanence));

        self.synapses[synapse as usize].permanence = permanence;
        Ok(())
    }

    fn min_permanence_synapse(&self, segment: Segment) -> Option<Synapse> {
        // The candidate is replaced only on a strictly-lower-by-epsilon
        // permanence, so the first synapse wins ties regardless of how the
        // permanences were rounded.
        let mut min_synapse = None;
        let mut min_permanence = Permanence::MAX;

        for &synapse in &self.segments[segment as usize].synapses {
            let permanence = self.synapses[synapse as usize].permanence;
            if permanence < min_permanence - EPSILON {
                min_synapse = Some(synapse);
                min_permanence = permanence;
            }
        }

        min_synapse
    }

    fn synapse_exists(&self, synapse: Synapse) -> bool {
        match self.synapses.get(synapse as usize) {
            Some(synapse_data) => self.segments[synapse_data.segment as usize]
                .synapses
                .contains(&synapse),
            None => false,
        }
    }

    fn remove_synapse_from_presynaptic_map(&mut self, synapse: Synapse) {
        let presynaptic_cell = self.synapses[synapse as usize].presynaptic_cell;
        if let Some(bucket) = self.synapses_for_presynaptic_cell.get_mut(&presynaptic_cell) {
            if let Some(position) = bucket.iter().position(|&entry| entry == synapse) {
                bucket.remove(position);
            }
            if bucket.is_empty() {
                self.synapses_for_presynaptic_cell.remove(&presynaptic_cell);
            }
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Gets the segments on a cell, ordered by `idx_on_cell`.
    #[inline]
    pub fn segments_for_cell(&self, cell: CellIdx) -> &[Segment] {
        &self.cells[cell as usize].segments
    }

    /// Gets the segment at a specific position on a cell.
    #[inline]
    pub fn get_segment(&self, cell: CellIdx, idx: SegmentIdx) -> Segment {
        self.cells[cell as usize].segments[idx as usize]
    }

    /// Gets the cell that owns a segment.
    #[inline]
    pub fn cell_for_segment(&self, segment: Segment) -> CellIdx {
        self.segments[segment as usize].cell
    }

    /// Gets the segment data.
    #[inline]
    pub fn data_for_segment(&self, segment: Segment) -> &SegmentData {
        &self.segments[segment as usize]
    }

    /// Gets the synapses on a segment, ordered by `idx_on_segment`.
    #[inline]
    pub fn synapses_for_segment(&self, segment: Segment) -> &[Synapse] {
        &self.segments[segment as usize].synapses
    }

    /// Gets the segment that owns a synapse.
    #[inline]
    pub fn segment_for_synapse(&self, synapse: Synapse) -> Segment {
        self.synapses[synapse as usize].segment
    }

    /// Gets the synapse data.
    #[inline]
    pub fn data_for_synapse(&self, synapse: Synapse) -> &SynapseData {
        &self.synapses[synapse as usize]
    }

    /// Gets the presynaptic cells of all synapses on a segment.
    pub fn presynaptic_cells_for_segment(&self, segment: Segment) -> Vec<CellIdx> {
        self.segments[segment as usize]
            .synapses
            .iter()
            .map(|&synapse| self.synapses[synapse as usize].presynaptic_cell)
            .collect()
    }

    /// Gets all synapses driven by a presynaptic cell.
    pub fn synapses_for_presynaptic_cell(&self, cell: CellIdx) -> &[Synapse] {
        self.synapses_for_presynaptic_cell
            .get(&cell)
            .map_or(&[], Vec::as_slice)
    }

    /// Compares two segments: by owning cell ascending, then by position on
    /// the cell ascending.
    pub fn compare_segments(&self, a: Segment, b: Segment) -> std::cmp::Ordering {
        let a_data = &self.segments[a as usize];
        let b_data = &self.segments[b as usize];
        a_data
            .cell
            .cmp(&b_data.cell)
            .then(a_data.idx_on_cell.cmp(&b_data.idx_on_cell))
    }

    // ========================================================================
    // Activity computation
    // ========================================================================

    /// Computes segment activity for a set of active presynaptic cells.
    ///
    /// Returns `(num_active_connected, num_active_potential)` vectors indexed
    /// by flat segment id (see [`Connections::segment_flat_list_length`]);
    /// destroyed slots are left at zero. A synapse counts as connected when
    /// its permanence is at least `connected_permanence` minus the comparison
    /// tolerance.
    pub fn compute_activity(
        &self,
        active_presynaptic_cells: &[CellIdx],
        connected_permanence: Permanence,
    ) -> (Vec<UInt>, Vec<UInt>) {
        let mut num_active_connected = vec![0; self.segments.len()];
        let mut num_active_potential = vec![0; self.segments.len()];

        for &cell in active_presynaptic_cells {
            self.compute_activity_for_cell(
                &mut num_active_connected,
                &mut num_active_potential,
                cell,
                connected_permanence,
            );
        }

        (num_active_connected, num_active_potential)
    }

    /// Accumulates segment activity for a single active presynaptic cell into
    /// caller-supplied count vectors.
    pub fn compute_activity_for_cell(
        &self,
        num_active_connected: &mut [UInt],
        num_active_potential: &mut [UInt],
        active_presynaptic_cell: CellIdx,
        connected_permanence: Permanence,
    ) {
        if let Some(synapses) = self
            .synapses_for_presynaptic_cell
            .get(&active_presynaptic_cell)
        {
            for &synapse in synapses {
                let synapse_data = &self.synapses[synapse as usize];
                let segment = synapse_data.segment as usize;
                num_active_potential[segment] += 1;
                if synapse_data.permanence >= connected_permanence - EPSILON {
                    num_active_connected[segment] += 1;
                }
            }
        }
    }

    // ========================================================================
    // Serialization
    // ========================================================================

    /// Writes the graph in the whitespace-separated text format.
    ///
    /// Only live segments and synapses are emitted. Permanences are written
    /// with Rust's shortest exact round-trip formatting; streams produced by
    /// environments with a different default float precision may not
    /// round-trip bit-exactly, which the comparison tolerance absorbs.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::IoError`] if the stream cannot be written.
    pub fn save<W: Write>(&self, stream: &mut W) -> Result<()> {
        writeln!(stream, "Connections")?;
        writeln!(stream, "{}", Self::VERSION)?;
        writeln!(
            stream,
            "{} {} {} ",
            self.cells.len(),
            self.max_segments_per_cell,
            self.max_synapses_per_segment
        )?;

        for cell_data in &self.cells {
            write!(stream, "{} ", cell_data.segments.len())?;

            for &segment in &cell_data.segments {
                let segment_data = &self.segments[segment as usize];

                write!(stream, "{} ", segment_data.last_used_iteration)?;
                write!(stream, "{} ", segment_data.synapses.len())?;

                for &synapse in &segment_data.synapses {
                    let synapse_data = &self.synapses[synapse as usize];
                    write!(
                        stream,
                        "{} {} ",
                        synapse_data.presynaptic_cell, synapse_data.permanence
                    )?;
                }
                writeln!(stream)?;
            }
            writeln!(stream)?;
        }
        writeln!(stream)?;

        writeln!(stream, "{} ", self.iteration)?;
        writeln!(stream, "~Connections")?;
        Ok(())
    }

    /// Reads a graph from the text format.
    ///
    /// Accepts both the current version and the legacy version 1 layout,
    /// which additionally carried per-segment and per-synapse `destroyed`
    /// flags; flagged records are silently skipped.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::FormatError`] for missing markers or malformed
    /// tokens and [`VelesError::InvalidState`] for streams written by a newer
    /// version.
    pub fn load<R: Read>(stream: R) -> Result<Self> {
        let mut reader = TokenReader::new(BufReader::new(stream));
        Self::load_tokens(&mut reader)
    }

    pub(crate) fn load_tokens<R: Read>(reader: &mut TokenReader<R>) -> Result<Self> {
        reader.expect_marker("Connections")?;

        let version: UInt = reader.parse()?;
        if version > Self::VERSION {
            return Err(VelesError::InvalidState(format!(
                "stream version {} is newer than supported version {}",
                version,
                Self::VERSION
            )));
        }

        let num_cells: CellIdx = reader.parse()?;
        let max_segments_per_cell: SegmentIdx = reader.parse()?;
        let max_synapses_per_segment: SynapseIdx = reader.parse()?;

        let mut connections = Self::new(ConnectionsParams {
            num_cells,
            max_segments_per_cell,
            max_synapses_per_segment,
        });

        for cell in 0..num_cells {
            let num_segments: usize = reader.parse()?;

            for _ in 0..num_segments {
                let destroyed_segment = if version < 2 {
                    reader.parse::<u8>()? != 0
                } else {
                    false
                };
                let last_used_iteration: Iteration = reader.parse()?;

                let segment = if destroyed_segment {
                    None
                } else {
                    Some(connections.restore_segment(cell, last_used_iteration))
                };

                let num_synapses: usize = reader.parse()?;
                for _ in 0..num_synapses {
                    let presynaptic_cell: CellIdx = reader.parse()?;
                    let permanence: Permanence = reader.parse()?;
                    let destroyed_synapse = if version < 2 {
                        reader.parse::<u8>()? != 0
                    } else {
                        false
                    };

                    if let Some(segment) = segment {
                        if !destroyed_synapse {
                            if presynaptic_cell >= num_cells {
                                return Err(VelesError::FormatError(format!(
                                    "presynaptic cell {presynaptic_cell} out of range"
                                )));
                            }
                            connections.restore_synapse(segment, presynaptic_cell, permanence);
                        }
                    }
                }
            }
        }

        connections.iteration = reader.parse()?;
        reader.expect_marker("~Connections")?;

        Ok(connections)
    }

    /// Appends a segment during deserialization, bypassing capacity eviction
    /// and event notification.
    fn restore_segment(&mut self, cell: CellIdx, last_used_iteration: Iteration) -> Segment {
        let segment = self.segments.len() as Segment;
        let idx_on_cell = self.cells[cell as usize].segments.len() as SegmentIdx;
        self.segments.push(SegmentData {
            synapses: SmallVec::new(),
            cell,
            idx_on_cell,
            last_used_iteration,
        });
        self.cells[cell as usize].segments.push(segment);
        segment
    }

    /// Appends a synapse during deserialization, bypassing capacity eviction
    /// and event notification.
    fn restore_synapse(
        &mut self,
        segment: Segment,
        presynaptic_cell: CellIdx,
        permanence: Permanence,
    ) -> Synapse {
        let synapse = self.synapses.len() as Synapse;
        let idx_on_segment = self.segments[segment as usize].synapses.len() as SynapseIdx;
        self.synapses.push(SynapseData {
            presynaptic_cell,
            permanence,
            segment,
            idx_on_segment,
        });
        self.segments[segment as usize].synapses.push(synapse);
        self.synapses_for_presynaptic_cell
            .entry(presynaptic_cell)
            .or_default()
            .push(synapse);
        synapse
    }
}

impl Clone for Connections {
    /// Clones the graph. Event subscribers are not cloned; the copy starts
    /// with no subscribers but keeps the token counter.
    fn clone(&self) -> Self {
        Self {
            cells: self.cells.clone(),
            segments: self.segments.clone(),
            destroyed_segments: self.destroyed_segments.clone(),
            synapses: self.synapses.clone(),
            destroyed_synapses: self.destroyed_synapses.clone(),
            max_segments_per_cell: self.max_segments_per_cell,
            max_synapses_per_segment: self.max_synapses_per_segment,
            iteration: self.iteration,
            synapses_for_presynaptic_cell: self.synapses_for_presynaptic_cell.clone(),
            next_event_token: self.next_event_token,
            event_handlers: BTreeMap::new(),
        }
    }
}

impl std::fmt::Debug for Connections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connections")
            .field("num_cells", &self.cells.len())
            .field("num_segments", &self.num_segments())
            .field("num_synapses", &self.num_synapses())
            .field("max_segments_per_cell", &self.max_segments_per_cell)
            .field("max_synapses_per_segment", &self.max_synapses_per_segment)
            .field("iteration", &self.iteration)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Connections {
    /// Structural equality: two graphs are equal when they are isomorphic
    /// under cell, segment, and synapse positions. Flat identifiers are
    /// deliberately ignored because free-list reuse lets functionally
    /// identical instances assign them differently. Permanences are compared
    /// exactly.
    #[allow(clippy::float_cmp)]
    fn eq(&self, other: &Self) -> bool {
        if self.max_segments_per_cell != other.max_segments_per_cell
            || self.max_synapses_per_segment != other.max_synapses_per_segment
            || self.cells.len() != other.cells.len()
            || self.iteration != other.iteration
        {
            return false;
        }

        for (cell_data, other_cell_data) in self.cells.iter().zip(&other.cells) {
            if cell_data.segments.len() != other_cell_data.segments.len() {
                return false;
            }

            for (&segment, &other_segment) in
                cell_data.segments.iter().zip(&other_cell_data.segments)
            {
                let segment_data = &self.segments[segment as usize];
                let other_segment_data = &other.segments[other_segment as usize];

                if segment_data.synapses.len() != other_segment_data.synapses.len()
                    || segment_data.last_used_iteration != other_segment_data.last_used_iteration
                    || segment_data.cell != other_segment_data.cell
                    || segment_data.idx_on_cell != other_segment_data.idx_on_cell
                {
                    return false;
                }

                for (&synapse, &other_synapse) in
                    segment_data.synapses.iter().zip(&other_segment_data.synapses)
                {
                    let synapse_data = &self.synapses[synapse as usize];
                    let other_synapse_data = &other.synapses[other_synapse as usize];

                    if synapse_data.presynaptic_cell != other_synapse_data.presynaptic_cell
                        || synapse_data.permanence != other_synapse_data.permanence
                        || synapse_data.idx_on_segment != other_synapse_data.idx_on_segment
                    {
                        return false;
                    }
                }
            }
        }

        if self.synapses_for_presynaptic_cell.len() != other.synapses_for_presynaptic_cell.len() {
            return false;
        }

        for (cell, synapses) in &self.synapses_for_presynaptic_cell {
            let other_synapses = match other.synapses_for_presynaptic_cell.get(cell) {
                Some(other_synapses) => other_synapses,
                None => return false,
            };
            if synapses.len() != other_synapses.len() {
                return false;
            }

            for (&synapse, &other_synapse) in synapses.iter().zip(other_synapses) {
                let synapse_data = &self.synapses[synapse as usize];
                let other_synapse_data = &other.synapses[other_synapse as usize];
                let segment_data = &self.segments[synapse_data.segment as usize];
                let other_segment_data = &other.segments[other_synapse_data.segment as usize];

                if segment_data.cell != other_segment_data.cell
                    || segment_data.idx_on_cell != other_segment_data.idx_on_cell
                    || synapse_data.idx_on_segment != other_synapse_data.idx_on_segment
                {
                    return false;
                }
            }
        }

        true
    }
}

impl Eq for Connections {}

/// Whitespace-token reader shared by the text deserializers. Reads one byte
/// at a time so it never consumes past the token it returns; wrap raw streams
/// in a `BufReader`.
pub(crate) struct TokenReader<R: Read> {
    stream: R,
}

impl<R: Read> TokenReader<R> {
    pub(crate) fn new(stream: R) -> Self {
        Self { stream }
    }

    pub(crate) fn token(&mut self) -> Result<String> {
        let mut byte = [0u8; 1];
        let mut token = String::new();

        loop {
            if self.stream.read(&mut byte)? == 0 {
                break;
            }
            let ch = byte[0] as char;
            if ch.is_ascii_whitespace() {
                if token.is_empty() {
                    continue;
                }
                break;
            }
            token.push(ch);
        }

        if token.is_empty() {
            return Err(VelesError::FormatError("unexpected end of stream".into()));
        }
        Ok(token)
    }

    pub(crate) fn parse<T: FromStr>(&mut self) -> Result<T> {
        let token = self.token()?;
        token
            .parse()
            .map_err(|_| VelesError::FormatError(format!("malformed token '{token}'")))
    }

    pub(crate) fn expect_marker(&mut self, marker: &str) -> Result<()> {
        let token = self.token()?;
        if token == marker {
            Ok(())
        } else {
            Err(VelesError::FormatError(format!(
                "expected '{marker}' marker, found '{token}'"
            )))
        }
    }
}

#[cfg(feature = "serde")]
pub(crate) mod schema {
    //! Structured snapshot of a [`Connections`] graph.
    //!
    //! The schema keeps the `destroyed` flags of the original wire format so
    //! streams written by older producers remain readable: the reader skips
    //! flagged entries, the writer never sets them.

    use super::{Connections, ConnectionsParams};
    use crate::error::{Result, VelesError};
    use crate::types::{CellIdx, Iteration, Permanence, SegmentIdx, SynapseIdx, UInt};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::io::{Read, Write};

    #[derive(Serialize, Deserialize)]
    pub(crate) struct SynapseSchema {
        pub presynaptic_cell: CellIdx,
        pub permanence: Permanence,
        pub destroyed: bool,
    }

    #[derive(Serialize, Deserialize)]
    pub(crate) struct SegmentSchema {
        pub last_used_iteration: Iteration,
        pub destroyed: bool,
        pub synapses: Vec<SynapseSchema>,
    }

    #[derive(Serialize, Deserialize)]
    pub(crate) struct CellSchema {
        pub segments: Vec<SegmentSchema>,
    }

    #[derive(Serialize, Deserialize)]
    pub(crate) struct ConnectionsSchema {
        pub version: UInt,
        pub cells: Vec<CellSchema>,
        pub max_segments_per_cell: SegmentIdx,
        pub max_synapses_per_segment: SynapseIdx,
        pub iteration: Iteration,
    }

    impl From<&Connections> for ConnectionsSchema {
        fn from(connections: &Connections) -> Self {
            let cells = (0..connections.num_cells() as CellIdx)
                .map(|cell| CellSchema {
                    segments: connections
                        .segments_for_cell(cell)
                        .iter()
                        .map(|&segment| {
                            let segment_data = connections.data_for_segment(segment);
                            SegmentSchema {
                                last_used_iteration: segment_data.last_used_iteration,
                                destroyed: false,
                                synapses: segment_data
                                    .synapses
                                    .iter()
                                    .map(|&synapse| {
                                        let synapse_data = connections.data_for_synapse(synapse);
                                        SynapseSchema {
                                            presynaptic_cell: synapse_data.presynaptic_cell,
                                            permanence: synapse_data.permanence,
                                            destroyed: false,
                                        }
                                    })
                                    .collect(),
                            }
                        })
                        .collect(),
                })
                .collect();

            Self {
                version: Connections::VERSION,
                cells,
                max_segments_per_cell: connections.max_segments_per_cell(),
                max_synapses_per_segment: connections.max_synapses_per_segment(),
                iteration: connections.iteration(),
            }
        }
    }

    impl TryFrom<ConnectionsSchema> for Connections {
        type Error = VelesError;

        fn try_from(schema: ConnectionsSchema) -> Result<Self> {
            if schema.version > Connections::VERSION {
                return Err(VelesError::InvalidState(format!(
                    "stream version {} is newer than supported version {}",
                    schema.version,
                    Connections::VERSION
                )));
            }

            let num_cells = schema.cells.len() as CellIdx;
            let mut connections = Connections::new(ConnectionsParams {
                num_cells,
                max_segments_per_cell: schema.max_segments_per_cell,
                max_synapses_per_segment: schema.max_synapses_per_segment,
            });

            for (cell, cell_schema) in schema.cells.into_iter().enumerate() {
                for segment_schema in cell_schema.segments {
                    if segment_schema.destroyed {
                        continue;
                    }
                    let segment = connections
                        .restore_segment(cell as CellIdx, segment_schema.last_used_iteration);

                    for synapse_schema in segment_schema.synapses {
                        if synapse_schema.destroyed {
                            continue;
                        }
                        if synapse_schema.presynaptic_cell >= num_cells {
                            return Err(VelesError::FormatError(format!(
                                "presynaptic cell {} out of range",
                                synapse_schema.presynaptic_cell
                            )));
                        }
                        connections.restore_synapse(
                            segment,
                            synapse_schema.presynaptic_cell,
                            synapse_schema.permanence,
                        );
                    }
                }
            }

            connections.iteration = schema.iteration;
            Ok(connections)
        }
    }

    impl Serialize for Connections {
        fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            ConnectionsSchema::from(self).serialize(serializer)
        }
    }

    impl<'de> Deserialize<'de> for Connections {
        fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            let schema = ConnectionsSchema::deserialize(deserializer)?;
            Connections::try_from(schema).map_err(serde::de::Error::custom)
        }
    }

    impl Connections {
        /// Writes the graph in the structured binary format.
        ///
        /// # Errors
        ///
        /// Returns [`VelesError::FormatError`] if encoding fails.
        pub fn write<W: Write>(&self, stream: W) -> Result<()> {
            bincode::serialize_into(stream, &ConnectionsSchema::from(self))
                .map_err(|err| VelesError::FormatError(format!("binary encoding failed: {err}")))
        }

        /// Reads a graph from the structured binary format. Entries flagged
        /// destroyed are skipped regardless of the stream version.
        ///
        /// # Errors
        ///
        /// Returns [`VelesError::FormatError`] if decoding fails and
        /// [`VelesError::InvalidState`] for streams written by a newer
        /// version.
        pub fn read<R: Read>(stream: R) -> Result<Self> {
            let schema: ConnectionsSchema = bincode::deserialize_from(stream)
                .map_err(|err| VelesError::FormatError(format!("binary decoding failed: {err}")))?;
            Self::try_from(schema)
        }
    }
}
