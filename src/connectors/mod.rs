//! External collaborators: custodians and asset metadata

pub mod asset_registry;
pub mod custodian;

pub use asset_registry::{AssetRegistry, StaticAssetRegistry};
pub use custodian::{
    CustodianConnector, CustodianError, CustodianRegistry, CustodianTransferRequest,
    MockCustodian, Receipt, TransferDirection,
};
