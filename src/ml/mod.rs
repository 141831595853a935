pub mod features;
pub mod forecaster;
pub mod gate;
pub mod model;
pub mod persistence;
pub mod search;
pub mod tracker;

pub use features::FeatureBuilder;
pub use forecaster::Forecaster;
pub use gate::PromotionGate;
pub use model::ForestEstimator;
pub use search::HyperparameterSearch;
