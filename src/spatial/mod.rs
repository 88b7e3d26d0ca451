pub mod bbox;
pub mod index;

pub use bbox::{BoundingBox, BoxManager};
pub use index::{IndexOptions, QueryCallback, SearchHit, SpatialIndex};
