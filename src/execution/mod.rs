// Order placement, signing and account polling
pub mod exchange;
pub mod gateway;
pub mod poller;
pub mod signing;
pub mod wire;

pub use exchange::ExchangeGateway;
pub use gateway::{
    OpenOrder, OrderGateway, OrderKind, OrderRequest, PositionSide, PositionSummary, Tif, Tpsl,
};
pub use poller::{PositionCallback, PositionPoller};
pub use signing::ActionSigner;
pub use wire::{float_to_wire, round_to};
