//! Behavioral scenarios for the temporal memory state machine.
//!
//! Each test drives the public surface through one or two timesteps and pins
//! the resulting cell sets, winner selection, permanence values, and segment
//! bookkeeping. Connectivity is seeded directly through the connections graph
//! where a scenario needs a known starting point.

use std::collections::BTreeSet;

use veles::prelude::*;
use veles::VelesError;

const EPSILON: f32 = 1e-7;

fn base_params() -> TemporalMemoryParams {
    TemporalMemoryParams {
        column_dimensions: vec![32],
        cells_per_column: 4,
        activation_threshold: 3,
        initial_permanence: 0.21,
        connected_permanence: 0.50,
        min_threshold: 2,
        max_new_synapse_count: 3,
        permanence_increment: 0.10,
        permanence_decrement: 0.10,
        predicted_segment_decrement: 0.0,
        seed: 42,
        ..Default::default()
    }
}

fn permanence_of(tm: &TemporalMemory, synapse: Synapse) -> Permanence {
    tm.connections().data_for_synapse(synapse).permanence
}

/// When a predicted column activates, only its depolarized cells activate.
#[test]
fn activate_correctly_predictive_cells() {
    let mut tm = TemporalMemory::new(base_params()).unwrap();

    let previous_active_cells = [0, 1, 2, 3];
    let expected_active_cells = vec![4];

    let segment = tm.connections_mut().create_segment(4).unwrap();
    for &cell in &previous_active_cells {
        tm.connections_mut().create_synapse(segment, cell, 0.5).unwrap();
    }

    tm.compute(&[0], true).unwrap();
    assert_eq!(tm.predictive_cells(), expected_active_cells.as_slice());
    tm.compute(&[1], true).unwrap();

    assert_eq!(tm.active_cells(), expected_active_cells.as_slice());
}

/// When an unpredicted column activates, every cell in it becomes active.
#[test]
fn burst_unpredicted_columns() {
    let mut tm = TemporalMemory::new(base_params()).unwrap();

    tm.compute(&[0], true).unwrap();

    assert_eq!(tm.active_cells(), &[0, 1, 2, 3]);
}

/// Zero active columns still compute, and all cell sets come out empty.
#[test]
fn zero_active_columns() {
    let mut tm = TemporalMemory::new(TemporalMemoryParams {
        predicted_segment_decrement: 0.02,
        ..base_params()
    })
    .unwrap();

    let segment = tm.connections_mut().create_segment(4).unwrap();
    for cell in 0..4 {
        tm.connections_mut().create_synapse(segment, cell, 0.5).unwrap();
    }

    tm.compute(&[0], true).unwrap();
    assert!(!tm.active_cells().is_empty());
    assert!(!tm.winner_cells().is_empty());
    assert!(!tm.predictive_cells().is_empty());

    tm.compute(&[], true).unwrap();

    assert!(tm.active_cells().is_empty());
    assert!(tm.winner_cells().is_empty());
    assert!(tm.predictive_cells().is_empty());
}

/// All predicted active cells are winners, even without learning.
#[test]
fn predicted_active_cells_are_always_winners() {
    let mut tm = TemporalMemory::new(base_params()).unwrap();

    let expected_winner_cells = [4, 6];

    for &cell in &expected_winner_cells {
        let segment = tm.connections_mut().create_segment(cell).unwrap();
        for presynaptic in 0..3 {
            tm.connections_mut()
                .create_synapse(segment, presynaptic, 0.5)
                .unwrap();
        }
    }

    tm.compute(&[0], false).unwrap();
    tm.compute(&[1], false).unwrap();

    assert_eq!(tm.winner_cells(), &expected_winner_cells);
}

/// Exactly one cell in a bursting column is a winner, even without learning.
#[test]
fn choose_one_winner_cell_in_bursting_column() {
    let mut tm = TemporalMemory::new(base_params()).unwrap();

    tm.compute(&[0], false).unwrap();

    let winners = tm.winner_cells();
    assert_eq!(winners.len(), 1);
    assert!(winners[0] < 4);
}

/// Active segments on predicted cells are reinforced: active synapses gain,
/// inactive synapses lose.
#[test]
fn reinforce_correctly_active_segments() {
    let mut tm = TemporalMemory::new(TemporalMemoryParams {
        initial_permanence: 0.2,
        max_new_synapse_count: 4,
        permanence_decrement: 0.08,
        predicted_segment_decrement: 0.02,
        ..base_params()
    })
    .unwrap();

    let segment = tm.connections_mut().create_segment(5).unwrap();
    let active_synapse_1 = tm.connections_mut().create_synapse(segment, 0, 0.5).unwrap();
    let active_synapse_2 = tm.connections_mut().create_synapse(segment, 1, 0.5).unwrap();
    let active_synapse_3 = tm.connections_mut().create_synapse(segment, 2, 0.5).unwrap();
    let inactive_synapse = tm.connections_mut().create_synapse(segment, 81, 0.5).unwrap();

    tm.compute(&[0], true).unwrap();
    tm.compute(&[1], true).unwrap();

    assert!((permanence_of(&tm, active_synapse_1) - 0.6).abs() < EPSILON);
    assert!((permanence_of(&tm, active_synapse_2) - 0.6).abs() < EPSILON);
    assert!((permanence_of(&tm, active_synapse_3) - 0.6).abs() < EPSILON);
    assert!((permanence_of(&tm, inactive_synapse) - 0.42).abs() < EPSILON);
}

/// The selected matching segment in a bursting column is reinforced.
#[test]
fn reinforce_selected_matching_segment_in_bursting_column() {
    let mut tm = TemporalMemory::new(TemporalMemoryParams {
        permanence_decrement: 0.08,
        ..base_params()
    })
    .unwrap();

    let selected = tm.connections_mut().create_segment(4).unwrap();
    let active_synapse_1 = tm.connections_mut().create_synapse(selected, 0, 0.3).unwrap();
    let active_synapse_2 = tm.connections_mut().create_synapse(selected, 1, 0.3).unwrap();
    let active_synapse_3 = tm.connections_mut().create_synapse(selected, 2, 0.3).unwrap();
    let inactive_synapse = tm.connections_mut().create_synapse(selected, 81, 0.3).unwrap();

    // Competition with a smaller potential overlap.
    let other = tm.connections_mut().create_segment(5).unwrap();
    tm.connections_mut().create_synapse(other, 0, 0.3).unwrap();
    tm.connections_mut().create_synapse(other, 1, 0.3).unwrap();
    tm.connections_mut().create_synapse(other, 81, 0.3).unwrap();

    tm.compute(&[0], true).unwrap();
    tm.compute(&[1], true).unwrap();

    assert!((permanence_of(&tm, active_synapse_1) - 0.4).abs() < EPSILON);
    assert!((permanence_of(&tm, active_synapse_2) - 0.4).abs() < EPSILON);
    assert!((permanence_of(&tm, active_synapse_3) - 0.4).abs() < EPSILON);
    assert!((permanence_of(&tm, inactive_synapse) - 0.22).abs() < EPSILON);
}

/// Matching-but-not-selected segments in a bursting column are untouched.
#[test]
fn no_change_to_nonselected_matching_segments_in_bursting_column() {
    let mut tm = TemporalMemory::new(TemporalMemoryParams {
        permanence_decrement: 0.08,
        ..base_params()
    })
    .unwrap();

    let selected = tm.connections_mut().create_segment(4).unwrap();
    for &presynaptic in &[0, 1, 2, 81] {
        tm.connections_mut().create_synapse(selected, presynaptic, 0.3).unwrap();
    }

    let other = tm.connections_mut().create_segment(5).unwrap();
    let untouched_1 = tm.connections_mut().create_synapse(other, 0, 0.3).unwrap();
    let untouched_2 = tm.connections_mut().create_synapse(other, 1, 0.3).unwrap();
    let untouched_3 = tm.connections_mut().create_synapse(other, 81, 0.3).unwrap();

    tm.compute(&[0], true).unwrap();
    tm.compute(&[1], true).unwrap();

    assert!((permanence_of(&tm, untouched_1) - 0.3).abs() < EPSILON);
    assert!((permanence_of(&tm, untouched_2) - 0.3).abs() < EPSILON);
    assert!((permanence_of(&tm, untouched_3) - 0.3).abs() < EPSILON);
}

/// In a predicted active column, matching-but-not-active segments are
/// untouched, on the predicted cell and elsewhere in the column alike.
#[test]
fn no_change_to_matching_segments_in_predicted_active_column() {
    let mut tm = TemporalMemory::new(base_params()).unwrap();

    let active_segment = tm.connections_mut().create_segment(4).unwrap();
    for cell in 0..4 {
        tm.connections_mut().create_synapse(active_segment, cell, 0.5).unwrap();
    }

    let matching_on_same_cell = tm.connections_mut().create_segment(4).unwrap();
    let synapse_1 = tm
        .connections_mut()
        .create_synapse(matching_on_same_cell, 0, 0.3)
        .unwrap();
    let synapse_2 = tm
        .connections_mut()
        .create_synapse(matching_on_same_cell, 1, 0.3)
        .unwrap();

    let matching_on_other_cell = tm.connections_mut().create_segment(5).unwrap();
    let synapse_3 = tm
        .connections_mut()
        .create_synapse(matching_on_other_cell, 0, 0.3)
        .unwrap();
    let synapse_4 = tm
        .connections_mut()
        .create_synapse(matching_on_other_cell, 1, 0.3)
        .unwrap();

    tm.compute(&[0], true).unwrap();
    assert_eq!(tm.predictive_cells(), &[4]);
    tm.compute(&[1], true).unwrap();

    assert!((permanence_of(&tm, synapse_1) - 0.3).abs() < EPSILON);
    assert!((permanence_of(&tm, synapse_2) - 0.3).abs() < EPSILON);
    assert!((permanence_of(&tm, synapse_3) - 0.3).abs() < EPSILON);
    assert!((permanence_of(&tm, synapse_4) - 0.3).abs() < EPSILON);
}

/// Without previous winner cells, a bursting column grows no segment at all.
#[test]
fn no_new_segment_if_not_enough_winner_cells() {
    let mut tm = TemporalMemory::new(TemporalMemoryParams {
        max_new_synapse_count: 2,
        ..base_params()
    })
    .unwrap();

    tm.compute(&[], true).unwrap();
    tm.compute(&[0], true).unwrap();

    assert_eq!(tm.connections().num_segments(), 0);
}

/// A new segment connects to at most `max_new_synapse_count` of the previous
/// winner cells.
#[test]
fn new_segment_add_synapses_to_subset_of_winner_cells() {
    let mut tm = TemporalMemory::new(TemporalMemoryParams {
        max_new_synapse_count: 2,
        ..base_params()
    })
    .unwrap();

    tm.compute(&[0, 1, 2], true).unwrap();
    let prev_winner_cells: Vec<CellIdx> = tm.winner_cells().to_vec();
    assert_eq!(prev_winner_cells.len(), 3);

    tm.compute(&[4], true).unwrap();

    let winner_cells = tm.winner_cells();
    assert_eq!(winner_cells.len(), 1);
    let segments = tm.connections().segments_for_cell(winner_cells[0]);
    assert_eq!(segments.len(), 1);
    let synapses = tm.connections().synapses_for_segment(segments[0]);
    assert_eq!(synapses.len(), 2);
    for &synapse in synapses {
        let synapse_data = tm.connections().data_for_synapse(synapse);
        assert!((synapse_data.permanence - 0.21).abs() < EPSILON);
        assert!(prev_winner_cells.contains(&synapse_data.presynaptic_cell));
    }
}

/// With fewer previous winner cells than `max_new_synapse_count`, a new
/// segment connects to all of them.
#[test]
fn new_segment_add_synapses_to_all_winner_cells() {
    let mut tm = TemporalMemory::new(TemporalMemoryParams {
        max_new_synapse_count: 4,
        ..base_params()
    })
    .unwrap();

    tm.compute(&[0, 1, 2], true).unwrap();
    let prev_winner_cells: Vec<CellIdx> = tm.winner_cells().to_vec();
    assert_eq!(prev_winner_cells.len(), 3);

    tm.compute(&[4], true).unwrap();

    let winner_cells = tm.winner_cells();
    assert_eq!(winner_cells.len(), 1);
    let segments = tm.connections().segments_for_cell(winner_cells[0]);
    assert_eq!(segments.len(), 1);
    let synapses = tm.connections().synapses_for_segment(segments[0]);
    assert_eq!(synapses.len(), 3);

    let mut presynaptic: Vec<CellIdx> = synapses
        .iter()
        .map(|&synapse| {
            let synapse_data = tm.connections().data_for_synapse(synapse);
            assert!((synapse_data.permanence - 0.21).abs() < EPSILON);
            synapse_data.presynaptic_cell
        })
        .collect();
    presynaptic.sort_unstable();
    assert_eq!(presynaptic, prev_winner_cells);
}

/// Growth on a matching segment tops its active synapse count up to
/// `max_new_synapse_count`.
#[test]
fn matching_segment_add_synapses_to_subset_of_winner_cells() {
    // One cell per column keeps the winner cells predictable.
    let mut tm = TemporalMemory::new(TemporalMemoryParams {
        cells_per_column: 1,
        min_threshold: 1,
        ..base_params()
    })
    .unwrap();

    let matching_segment = tm.connections_mut().create_segment(4).unwrap();
    tm.connections_mut().create_synapse(matching_segment, 0, 0.5).unwrap();

    tm.compute(&[0, 1, 2, 3], true).unwrap();
    assert_eq!(tm.winner_cells(), &[0, 1, 2, 3]);

    tm.compute(&[4], true).unwrap();

    let synapses = tm.connections().synapses_for_segment(matching_segment);
    assert_eq!(synapses.len(), 3);
    for &synapse in &synapses[1..] {
        let synapse_data = tm.connections().data_for_synapse(synapse);
        assert!((synapse_data.permanence - 0.21).abs() < EPSILON);
        assert!([1, 2, 3].contains(&synapse_data.presynaptic_cell));
    }
}

/// With a small winner pool, growth on a matching segment takes all of it.
#[test]
fn matching_segment_add_synapses_to_all_winner_cells() {
    let mut tm = TemporalMemory::new(TemporalMemoryParams {
        cells_per_column: 1,
        min_threshold: 1,
        ..base_params()
    })
    .unwrap();

    let matching_segment = tm.connections_mut().create_segment(4).unwrap();
    tm.connections_mut().create_synapse(matching_segment, 0, 0.5).unwrap();

    tm.compute(&[0, 1], true).unwrap();
    assert_eq!(tm.winner_cells(), &[0, 1]);

    tm.compute(&[4], true).unwrap();

    let synapses = tm.connections().synapses_for_segment(matching_segment);
    assert_eq!(synapses.len(), 2);
    let synapse_data = tm.connections().data_for_synapse(synapses[1]);
    assert!((synapse_data.permanence - 0.21).abs() < EPSILON);
    assert_eq!(synapse_data.presynaptic_cell, 1);
}

/// Growth on an active segment is driven by its potential overlap, not its
/// connected overlap.
#[test]
fn active_segment_grow_synapses_according_to_potential_overlap() {
    let mut tm = TemporalMemory::new(TemporalMemoryParams {
        cells_per_column: 1,
        activation_threshold: 2,
        min_threshold: 1,
        max_new_synapse_count: 4,
        ..base_params()
    })
    .unwrap();

    let active_segment = tm.connections_mut().create_segment(5).unwrap();
    tm.connections_mut().create_synapse(active_segment, 0, 0.5).unwrap();
    tm.connections_mut().create_synapse(active_segment, 1, 0.5).unwrap();
    tm.connections_mut().create_synapse(active_segment, 2, 0.2).unwrap();

    tm.compute(&[0, 1, 2, 3, 4], true).unwrap();
    assert_eq!(tm.winner_cells(), &[0, 1, 2, 3, 4]);

    tm.compute(&[5], true).unwrap();

    let synapses = tm.connections().synapses_for_segment(active_segment);
    assert_eq!(synapses.len(), 4);

    let synapse_data = tm.connections().data_for_synapse(synapses[3]);
    assert!((synapse_data.permanence - 0.21).abs() < EPSILON);
    assert!([3, 4].contains(&synapse_data.presynaptic_cell));
}

/// A synapse punished to zero for a wrong prediction is destroyed.
#[test]
fn destroy_weak_synapse_on_wrong_prediction() {
    let mut tm = TemporalMemory::new(TemporalMemoryParams {
        initial_permanence: 0.2,
        max_new_synapse_count: 4,
        predicted_segment_decrement: 0.02,
        ..base_params()
    })
    .unwrap();

    let segment = tm.connections_mut().create_segment(5).unwrap();
    tm.connections_mut().create_synapse(segment, 0, 0.5).unwrap();
    tm.connections_mut().create_synapse(segment, 1, 0.5).unwrap();
    tm.connections_mut().create_synapse(segment, 2, 0.5).unwrap();
    // The weak synapse.
    tm.connections_mut().create_synapse(segment, 3, 0.015).unwrap();

    tm.compute(&[0], true).unwrap();
    tm.compute(&[2], true).unwrap();

    assert_eq!(tm.connections().num_synapses_on_segment(segment), 3);
    assert!(!tm
        .connections()
        .presynaptic_cells_for_segment(segment)
        .contains(&3));
}

/// A synapse decremented to zero while its segment is reinforced is
/// destroyed.
#[test]
fn destroy_weak_synapse_on_active_reinforce() {
    let mut tm = TemporalMemory::new(TemporalMemoryParams {
        initial_permanence: 0.2,
        predicted_segment_decrement: 0.02,
        ..base_params()
    })
    .unwrap();

    let segment = tm.connections_mut().create_segment(5).unwrap();
    tm.connections_mut().create_synapse(segment, 0, 0.5).unwrap();
    tm.connections_mut().create_synapse(segment, 1, 0.5).unwrap();
    tm.connections_mut().create_synapse(segment, 2, 0.5).unwrap();
    // Weak inactive synapse.
    tm.connections_mut().create_synapse(segment, 81, 0.09).unwrap();

    tm.compute(&[0], true).unwrap();
    tm.compute(&[1], true).unwrap();

    assert_eq!(tm.connections().num_synapses_on_segment(segment), 3);
    assert!(!tm
        .connections()
        .presynaptic_cells_for_segment(segment)
        .contains(&81));
}

/// Growth past `max_synapses_per_segment` evicts the weakest synapses.
#[test]
fn recycle_weakest_synapse_to_make_room_for_new_synapse() {
    let mut tm = TemporalMemory::new(TemporalMemoryParams {
        cells_per_column: 1,
        min_threshold: 1,
        permanence_increment: 0.02,
        permanence_decrement: 0.02,
        max_synapses_per_segment: 3,
        ..base_params()
    })
    .unwrap();

    let matching_segment = tm.connections_mut().create_segment(4).unwrap();
    tm.connections_mut().create_synapse(matching_segment, 81, 0.6).unwrap();
    // Still the weakest after the increment is applied.
    tm.connections_mut().create_synapse(matching_segment, 0, 0.11).unwrap();

    tm.compute(&[0, 1, 2], true).unwrap();
    assert_eq!(tm.winner_cells(), &[0, 1, 2]);

    tm.compute(&[4], true).unwrap();

    let synapses = tm.connections().synapses_for_segment(matching_segment);
    assert_eq!(synapses.len(), 3);
    for &synapse in synapses {
        assert_ne!(tm.connections().data_for_synapse(synapse).presynaptic_cell, 0);
    }
}

/// Creating a segment past `max_segments_per_cell` evicts the least recently
/// active segment, and its synapses vanish with it.
#[test]
fn recycle_least_recently_active_segment_to_make_room_for_new_segment() {
    let mut tm = TemporalMemory::new(TemporalMemoryParams {
        cells_per_column: 1,
        initial_permanence: 0.5,
        permanence_increment: 0.02,
        permanence_decrement: 0.02,
        max_segments_per_cell: 2,
        ..base_params()
    })
    .unwrap();

    tm.compute(&[0, 1, 2], true).unwrap();
    tm.compute(&[9], true).unwrap();

    assert_eq!(tm.connections().num_segments_on_cell(9), 1);
    let oldest_segment = tm.connections().segments_for_cell(9)[0];

    tm.reset();
    tm.compute(&[3, 4, 5], true).unwrap();
    tm.compute(&[9], true).unwrap();

    assert_eq!(tm.connections().num_segments_on_cell(9), 2);

    let old_presynaptic: BTreeSet<CellIdx> = tm
        .connections()
        .presynaptic_cells_for_segment(oldest_segment)
        .into_iter()
        .collect();

    tm.reset();
    tm.compute(&[6, 7, 8], true).unwrap();
    tm.compute(&[9], true).unwrap();

    assert_eq!(tm.connections().num_segments_on_cell(9), 2);

    // None of the surviving segments share presynaptic cells with the
    // evicted one.
    for &segment in tm.connections().segments_for_cell(9) {
        let new_presynaptic: BTreeSet<CellIdx> = tm
            .connections()
            .presynaptic_cells_for_segment(segment)
            .into_iter()
            .collect();
        assert!(old_presynaptic.is_disjoint(&new_presynaptic));
    }
}

/// A segment whose last synapse is punished away is destroyed.
#[test]
fn destroy_segments_with_too_few_synapses_to_be_matching() {
    let mut tm = TemporalMemory::new(TemporalMemoryParams {
        initial_permanence: 0.2,
        max_new_synapse_count: 4,
        predicted_segment_decrement: 0.02,
        ..base_params()
    })
    .unwrap();

    let segment = tm.connections_mut().create_segment(5).unwrap();
    for cell in 0..4 {
        tm.connections_mut().create_synapse(segment, cell, 0.015).unwrap();
    }

    tm.compute(&[0], true).unwrap();
    tm.compute(&[2], true).unwrap();

    assert_eq!(tm.connections().num_segments_on_cell(5), 0);
}

/// Matching segments in columns that fail to activate are punished on their
/// active synapses only.
#[test]
fn punish_matching_segments_in_inactive_columns() {
    let mut tm = TemporalMemory::new(TemporalMemoryParams {
        initial_permanence: 0.2,
        max_new_synapse_count: 4,
        predicted_segment_decrement: 0.02,
        ..base_params()
    })
    .unwrap();

    let previous_inactive_cell = 81;

    let active_segment = tm.connections_mut().create_segment(42).unwrap();
    let active_synapse_1 = tm.connections_mut().create_synapse(active_segment, 0, 0.5).unwrap();
    let active_synapse_2 = tm.connections_mut().create_synapse(active_segment, 1, 0.5).unwrap();
    let active_synapse_3 = tm.connections_mut().create_synapse(active_segment, 2, 0.5).unwrap();
    let inactive_synapse_1 = tm
        .connections_mut()
        .create_synapse(active_segment, previous_inactive_cell, 0.5)
        .unwrap();

    let matching_segment = tm.connections_mut().create_segment(43).unwrap();
    let active_synapse_4 = tm.connections_mut().create_synapse(matching_segment, 0, 0.5).unwrap();
    let active_synapse_5 = tm.connections_mut().create_synapse(matching_segment, 1, 0.5).unwrap();
    let inactive_synapse_2 = tm
        .connections_mut()
        .create_synapse(matching_segment, previous_inactive_cell, 0.5)
        .unwrap();

    tm.compute(&[0], true).unwrap();
    tm.compute(&[1], true).unwrap();

    assert!((permanence_of(&tm, active_synapse_1) - 0.48).abs() < EPSILON);
    assert!((permanence_of(&tm, active_synapse_2) - 0.48).abs() < EPSILON);
    assert!((permanence_of(&tm, active_synapse_3) - 0.48).abs() < EPSILON);
    assert!((permanence_of(&tm, active_synapse_4) - 0.48).abs() < EPSILON);
    assert!((permanence_of(&tm, active_synapse_5) - 0.48).abs() < EPSILON);
    assert!((permanence_of(&tm, inactive_synapse_1) - 0.50).abs() < EPSILON);
    assert!((permanence_of(&tm, inactive_synapse_2) - 0.50).abs() < EPSILON);
}

/// In a bursting column with no matching segments, the new segment lands on
/// a cell with the fewest segments, chosen uniformly among ties.
#[test]
fn add_segment_to_cell_with_fewest_segments() {
    let mut grew_on_cell_1 = false;
    let mut grew_on_cell_2 = false;

    for seed in 0..100 {
        let mut tm = TemporalMemory::new(TemporalMemoryParams {
            initial_permanence: 0.2,
            max_new_synapse_count: 4,
            predicted_segment_decrement: 0.02,
            seed,
            ..base_params()
        })
        .unwrap();

        // Cells 0 and 3 start with a nonmatching segment each, leaving cells
        // 1 and 2 tied for fewest segments.
        let segment_1 = tm.connections_mut().create_segment(0).unwrap();
        tm.connections_mut().create_synapse(segment_1, 4, 0.5).unwrap();
        let segment_2 = tm.connections_mut().create_segment(3).unwrap();
        tm.connections_mut().create_synapse(segment_2, 5, 0.5).unwrap();

        tm.compute(&[1, 2, 3, 4], true).unwrap();
        let prev_winner_cells: Vec<CellIdx> = tm.winner_cells().to_vec();
        tm.compute(&[0], true).unwrap();

        assert_eq!(tm.active_cells(), &[0, 1, 2, 3]);

        assert_eq!(tm.connections().num_segments(), 3);
        assert_eq!(tm.connections().num_segments_on_cell(0), 1);
        assert_eq!(tm.connections().num_segments_on_cell(3), 1);
        assert_eq!(tm.connections().num_synapses_on_segment(segment_1), 1);
        assert_eq!(tm.connections().num_synapses_on_segment(segment_2), 1);

        let mut grown = tm.connections().segments_for_cell(1).to_vec();
        if grown.is_empty() {
            grown = tm.connections().segments_for_cell(2).to_vec();
            assert!(!grown.is_empty());
            grew_on_cell_2 = true;
        } else {
            grew_on_cell_1 = true;
        }

        assert_eq!(grown.len(), 1);
        let synapses = tm.connections().synapses_for_segment(grown[0]);
        assert_eq!(synapses.len(), 4);

        // One synapse per previous winner cell, i.e. one per active column.
        let mut column_checklist: BTreeSet<UInt> = [1, 2, 3, 4].into_iter().collect();
        for &synapse in synapses {
            let synapse_data = tm.connections().data_for_synapse(synapse);
            assert!((synapse_data.permanence - 0.2).abs() < EPSILON);
            assert!(prev_winner_cells.contains(&synapse_data.presynaptic_cell));

            let column = tm.column_for_cell(synapse_data.presynaptic_cell).unwrap();
            assert!(column_checklist.remove(&column));
        }
        assert!(column_checklist.is_empty());
    }

    assert!(grew_on_cell_1);
    assert!(grew_on_cell_2);
}

/// A matching segment with more active potential synapses than
/// `max_new_synapse_count` grows nothing; the subtraction must not wrap.
#[test]
fn max_new_synapse_count_overflow() {
    let mut tm = TemporalMemory::new(TemporalMemoryParams {
        initial_permanence: 0.2,
        max_new_synapse_count: 4,
        predicted_segment_decrement: 0.02,
        ..base_params()
    })
    .unwrap();

    let segment = tm.connections_mut().create_segment(8).unwrap();
    for cell in 0..8 {
        tm.connections_mut().create_synapse(segment, cell, 0.2).unwrap();
    }
    let sample_synapse = tm.connections().synapses_for_segment(segment)[5];

    tm.compute(&[0, 1, 3, 4], true).unwrap();
    assert_eq!(tm.matching_segments().len(), 1);

    tm.compute(&[2], true).unwrap();

    // The segment learned...
    assert!((permanence_of(&tm, sample_synapse) - 0.3).abs() < EPSILON);
    // ...but grew nothing.
    assert_eq!(tm.connections().num_synapses_on_segment(segment), 8);
}

/// With learning disabled, no mixture of predicted, bursting, and wrongly
/// predicting columns changes the graph.
#[test]
fn connections_never_change_when_learning_disabled() {
    let mut tm = TemporalMemory::new(TemporalMemoryParams {
        initial_permanence: 0.2,
        max_new_synapse_count: 4,
        predicted_segment_decrement: 0.02,
        ..base_params()
    })
    .unwrap();

    let correct_segment = tm.connections_mut().create_segment(4).unwrap();
    tm.connections_mut().create_synapse(correct_segment, 0, 0.5).unwrap();
    tm.connections_mut().create_synapse(correct_segment, 1, 0.5).unwrap();
    tm.connections_mut().create_synapse(correct_segment, 2, 0.5).unwrap();

    let wrong_segment = tm.connections_mut().create_segment(43).unwrap();
    tm.connections_mut().create_synapse(wrong_segment, 0, 0.5).unwrap();
    tm.connections_mut().create_synapse(wrong_segment, 1, 0.5).unwrap();
    tm.connections_mut().create_synapse(wrong_segment, 81, 0.5).unwrap();

    let before = tm.connections().clone();

    tm.compute(&[0], false).unwrap();
    // Column 1 is predicted, column 2 bursts.
    tm.compute(&[1, 2], false).unwrap();

    assert_eq!(&before, tm.connections());
}

/// Identical configuration, seed, and input stream produce identical state.
#[test]
fn identical_runs_are_deterministic() {
    let make = || {
        TemporalMemory::new(TemporalMemoryParams {
            column_dimensions: vec![64],
            cells_per_column: 4,
            activation_threshold: 2,
            min_threshold: 1,
            max_new_synapse_count: 4,
            predicted_segment_decrement: 0.02,
            seed: 1993,
            ..base_params()
        })
        .unwrap()
    };
    let mut tm1 = make();
    let mut tm2 = make();

    // A short repeating sequence with occasional resets keeps all branches
    // (burst, predict, punish) exercised.
    let patterns: [&[UInt]; 4] = [&[0, 5, 9, 17], &[2, 5, 33, 47], &[9, 17, 33, 60], &[0, 2, 60]];

    for round in 0..8 {
        if round % 3 == 0 {
            tm1.reset();
            tm2.reset();
        }
        for pattern in &patterns {
            tm1.compute(pattern, true).unwrap();
            tm2.compute(pattern, true).unwrap();

            assert_eq!(tm1.active_cells(), tm2.active_cells());
            assert_eq!(tm1.winner_cells(), tm2.winner_cells());
            assert_eq!(tm1.predictive_cells(), tm2.predictive_cells());
            assert_eq!(tm1.connections(), tm2.connections());
        }
    }
}

fn check_tm_eq(tm1: &TemporalMemory, tm2: &TemporalMemory) {
    assert_eq!(tm1.number_of_columns(), tm2.number_of_columns());
    assert_eq!(tm1.cells_per_column(), tm2.cells_per_column());
    assert_eq!(tm1.activation_threshold(), tm2.activation_threshold());
    assert_eq!(tm1.min_threshold(), tm2.min_threshold());
    assert_eq!(tm1.max_new_synapse_count(), tm2.max_new_synapse_count());
    assert!((tm1.initial_permanence() - tm2.initial_permanence()).abs() < EPSILON);
    assert!((tm1.connected_permanence() - tm2.connected_permanence()).abs() < EPSILON);
    assert!((tm1.permanence_increment() - tm2.permanence_increment()).abs() < EPSILON);
    assert!((tm1.permanence_decrement() - tm2.permanence_decrement()).abs() < EPSILON);
}

fn trained_tm() -> (TemporalMemory, Vec<Vec<UInt>>) {
    let mut tm = TemporalMemory::new(TemporalMemoryParams {
        column_dimensions: vec![100],
        cells_per_column: 4,
        activation_threshold: 7,
        initial_permanence: 0.37,
        connected_permanence: 0.58,
        min_threshold: 4,
        max_new_synapse_count: 18,
        permanence_increment: 0.23,
        permanence_decrement: 0.08,
        predicted_segment_decrement: 0.0,
        seed: 91,
        ..Default::default()
    })
    .unwrap();

    let sequence = vec![
        vec![45, 53, 70, 83],
        vec![8, 59, 65, 67],
        vec![25, 39, 98, 99],
        vec![11, 14, 66, 78],
        vec![69, 87, 95, 96],
    ];

    for _ in 0..3 {
        for pattern in &sequence {
            tm.compute(pattern, true).unwrap();
        }
    }

    (tm, sequence)
}

/// After a round-trip through either wire format, a restored instance stays
/// in lockstep with the original, including random decisions.
fn assert_continues_identically(mut tm1: TemporalMemory, mut tm2: TemporalMemory, sequence: &[Vec<UInt>]) {
    check_tm_eq(&tm1, &tm2);
    assert_eq!(tm1.connections(), tm2.connections());
    assert_eq!(tm1.active_cells(), tm2.active_cells());
    assert_eq!(tm1.winner_cells(), tm2.winner_cells());
    assert_eq!(tm1.predictive_cells(), tm2.predictive_cells());

    tm1.compute(&sequence[0], true).unwrap();
    tm2.compute(&sequence[0], true).unwrap();
    assert_eq!(tm1.active_cells(), tm2.active_cells());
    assert_eq!(tm1.winner_cells(), tm2.winner_cells());
    assert_eq!(tm1.connections(), tm2.connections());

    // A non-following pattern forces bursting, which consumes the RNG.
    tm1.compute(&sequence[3], true).unwrap();
    tm2.compute(&sequence[3], true).unwrap();
    assert_eq!(tm1.active_cells(), tm2.active_cells());
    assert_eq!(tm1.winner_cells(), tm2.winner_cells());

    let active1 = tm1.active_segments();
    let active2 = tm2.active_segments();
    assert_eq!(active1.len(), active2.len());
    for (&segment1, &segment2) in active1.iter().zip(active2) {
        assert_eq!(
            tm1.connections().cell_for_segment(segment1),
            tm2.connections().cell_for_segment(segment2)
        );
    }

    let matching1 = tm1.matching_segments();
    let matching2 = tm2.matching_segments();
    assert_eq!(matching1.len(), matching2.len());
    for (&segment1, &segment2) in matching1.iter().zip(matching2) {
        assert_eq!(
            tm1.connections().cell_for_segment(segment1),
            tm2.connections().cell_for_segment(segment2)
        );
    }

    assert_eq!(tm1.connections(), tm2.connections());
}

#[test]
fn text_roundtrip_continues_identically() {
    let (tm1, sequence) = trained_tm();

    let mut buffer = Vec::new();
    tm1.save(&mut buffer).unwrap();
    let tm2 = TemporalMemory::load(buffer.as_slice()).unwrap();

    assert_continues_identically(tm1, tm2, &sequence);
}

#[cfg(feature = "serde")]
#[test]
fn binary_roundtrip_continues_identically() {
    use veles::serialization::{Serializable, SerializableFormat};

    let (tm1, sequence) = trained_tm();

    let bytes = tm1.to_bytes(SerializableFormat::Binary).unwrap();
    let tm2 = TemporalMemory::from_bytes(&bytes, SerializableFormat::Binary).unwrap();

    assert_continues_identically(tm1, tm2, &sequence);
}

#[cfg(feature = "serde")]
#[test]
fn file_roundtrip_through_both_formats() {
    use veles::serialization::{Serializable, SerializableFormat};

    let (tm, _) = trained_tm();
    let dir = tempfile::tempdir().unwrap();

    for (name, format) in [
        ("model.bin", SerializableFormat::Binary),
        ("model.json", SerializableFormat::Json),
    ] {
        let path = dir.path().join(name);
        tm.save_to_file(&path, format).unwrap();
        let restored = TemporalMemory::load_from_file(&path, format).unwrap();
        assert_eq!(tm.connections(), restored.connections());
        assert_eq!(tm.active_cells(), restored.active_cells());
        assert_eq!(tm.predictive_cells(), restored.predictive_cells());
    }
}

#[test]
fn compute_rejects_unsorted_columns_without_mutating() {
    let mut tm = TemporalMemory::new(base_params()).unwrap();
    tm.compute(&[3, 7], true).unwrap();
    let before = tm.connections().clone();
    let active_before = tm.active_cells().to_vec();

    assert!(matches!(
        tm.compute(&[7, 3], true),
        Err(VelesError::InvalidArgument(_))
    ));

    assert_eq!(&before, tm.connections());
    assert_eq!(active_before, tm.active_cells());
}
