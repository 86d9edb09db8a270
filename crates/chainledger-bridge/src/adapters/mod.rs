//! Concrete bridge adapters, one per messaging network.

pub mod ccip;
pub mod hyperlane;
pub mod layerzero;

pub use ccip::CcipAdapter;
pub use hyperlane::HyperlaneAdapter;
pub use layerzero::LayerZeroAdapter;
