pub mod bluetooth;
#[cfg(test)]
pub mod mock;
pub mod traits;

pub use bluetooth::BluerRadio;
pub use traits::RadioAdapter;
