pub mod geocoding;

pub use geocoding::calculate_distance_km;
