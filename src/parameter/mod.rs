#[allow(clippy::module_inception)]
mod parameter;
pub use parameter::{BoundsPolicy, Parameter, ParameterDomain, ParameterInit, ParameterSpec};

mod path;
pub use path::ParameterPath;

mod table;
pub use table::ParameterTable;
