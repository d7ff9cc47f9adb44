mod backend;
pub mod backends;
mod registry;
mod result;

pub use backend::Detector;
pub use backends::StubDetector;
#[cfg(feature = "backend-tract")]
pub use backends::TractDetector;
pub use registry::{ModelSet, ModelSettings, ModelsSettings};
pub use result::{Detection, RawDetection};
