use std::collections::HashMap;
use std::sync::Arc;

use super::{
    CardanoScanner, ChainScanner, CosmosScanner, Erc20Scanner, EvmNativeScanner, RippleScanner,
    ScannerContext,
};
use crate::error::{InitFailure, ScannerInitError};

/// Builds a scanner for one configuration.
pub type ScannerFactory =
    Arc<dyn Fn(&ScannerContext) -> Result<Box<dyn ChainScanner>, InitFailure> + Send + Sync>;

pub const COSMOS_CHAINS: &[&str] = &[
    "cosmoshub",
    "osmosis",
    "akash",
    "juno",
    "celestia",
    "injective",
    "stargaze",
    "kava",
];

pub const EVM_CHAINS: &[&str] = &[
    "ethereum", "arbitrum", "optimism", "base", "polygon", "bsc", "avalanche",
];

/// Lookup table from `(chain, scanner_type)` to a scanner factory.
#[derive(Clone, Default)]
pub struct ScannerRegistry {
    factories: HashMap<(String, String), ScannerFactory>,
}

fn boxed<S, F>(build: F) -> ScannerFactory
where
    S: ChainScanner + 'static,
    F: Fn(&ScannerContext) -> Result<S, InitFailure> + Send + Sync + 'static,
{
    Arc::new(
        move |ctx: &ScannerContext| -> Result<Box<dyn ChainScanner>, InitFailure> {
            Ok(Box::new(build(ctx)?))
        },
    )
}

impl ScannerRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every scanner shipped with the monitor.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("ripple", "native", boxed(RippleScanner::from_context));
        registry.register("cardano", "blockfrost-native", boxed(CardanoScanner::from_context));
        for chain in COSMOS_CHAINS {
            registry.register(chain, "native", boxed(CosmosScanner::from_context));
        }
        for chain in EVM_CHAINS {
            registry.register(chain, "native", boxed(EvmNativeScanner::from_context));
            registry.register(chain, "erc20", boxed(Erc20Scanner::from_context));
        }
        registry
    }

    pub fn register(&mut self, chain: &str, scanner_type: &str, factory: ScannerFactory) {
        self.factories
            .insert((chain.to_string(), scanner_type.to_string()), factory);
    }

    pub fn supports(&self, chain: &str, scanner_type: &str) -> bool {
        self.factories
            .contains_key(&(chain.to_string(), scanner_type.to_string()))
    }

    /// Build the scanner for `ctx`. Initialization is left to the caller.
    pub fn build(&self, ctx: &ScannerContext) -> Result<Box<dyn ChainScanner>, ScannerInitError> {
        let id = ctx.id();
        let factory = self
            .factories
            .get(&(id.chain.clone(), id.scanner_type.clone()))
            .ok_or_else(|| ScannerInitError::new(id.clone(), InitFailure::Unsupported))?;
        factory(ctx).map_err(|e| ScannerInitError::new(id, e))
    }
}
