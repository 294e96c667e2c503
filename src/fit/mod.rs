mod lm;
pub use lm::LevenbergMarquardt;

mod problem;

mod result;
pub use result::{FitResult, FitState, FitStatus};

mod run;
pub use run::FitRun;
