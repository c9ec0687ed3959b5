//! Configuration space and capability chain.

pub mod capability;
pub mod config_space;

pub use capability::{
    clear_vf_enable, install_msix, remove_msix, set_vf_enable, write_vf_bar, write_vf_routing,
    CapabilityChain, ChainBuilder, SriovParams,
};
pub use config_space::{ConfigSpace, PCIE_CONFIG_SPACE_SIZE, PCI_CONFIG_SPACE_SIZE};
