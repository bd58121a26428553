//! Built-in drivers: software reference devices and network proxies.

pub mod network;
pub mod soft;

use std::sync::Arc;

use crate::net::server::TcpServerFactory;
use crate::record::DriverRegistry;

pub use network::NetworkDriverFactory;

/// Register every driver shipped with this crate.
pub fn register_builtin(registry: &mut DriverRegistry) {
    registry.register(Arc::new(TcpServerFactory));

    registry.register(Arc::new(soft::SoftMotorFactory));
    registry.register(Arc::new(soft::SoftMcaFactory));
    registry.register(Arc::new(soft::SoftMceFactory));
    registry.register(Arc::new(soft::SoftScalerFactory));
    registry.register(Arc::new(soft::SoftTimerFactory));
    registry.register(Arc::new(soft::SoftPulserFactory));
    registry.register(Arc::new(soft::ScalerAutoscaleFactory));

    registry.register(Arc::new(NetworkDriverFactory::motor()));
    registry.register(Arc::new(NetworkDriverFactory::mca()));
    registry.register(Arc::new(NetworkDriverFactory::scaler()));
    registry.register(Arc::new(NetworkDriverFactory::timer()));
}
