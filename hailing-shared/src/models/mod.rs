pub mod events;
pub mod state;

pub use state::TripState;
