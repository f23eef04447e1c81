mod compactify;
mod enumerate;
mod generate;
mod package;
mod verify;

pub use compactify::run_compactify;
pub use enumerate::run_enumerate;
pub use generate::run_generate;
pub use package::run_package;
pub use verify::run_verify;
