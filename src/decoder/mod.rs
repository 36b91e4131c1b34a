pub mod angles;
pub mod cycle_sync;
pub mod data_frame;
pub mod fix_solver;
pub mod geometry;
pub mod input;
pub mod pulse_buffer;
