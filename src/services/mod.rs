pub mod engine;
pub mod exposure;
pub mod horizon;
pub mod near_field;
pub mod open_meteo;
pub mod osm;
pub mod poller;
pub mod raster;
pub mod regeneration;
pub mod status;
pub mod store;
pub mod sun;
pub mod weather;
