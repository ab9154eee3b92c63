mod conflict_detector;
mod overlay;
mod resolver;

pub use conflict_detector::{ConflictDetector, DetectionRules, Divergence};
pub use overlay::OptimisticOverlay;
pub use resolver::{ConflictResolver, Resolution};
