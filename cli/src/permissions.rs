// Desktop permission gate
//
// Desktop stacks authorize Bluetooth per process at the OS level (macOS
// prompts on first adapter use, BlueZ and WinRT rely on group/app policy),
// so there is nothing to request at runtime. Capabilities can still be
// withheld from the command line to exercise the denial path.

use async_trait::async_trait;
use gattlink_core::{Capability, PermissionGate};
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct DesktopPermissions {
    withheld: Vec<Capability>,
}

impl DesktopPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn withhold(mut self, capability: Capability) -> Self {
        if !self.withheld.contains(&capability) {
            self.withheld.push(capability);
        }
        self
    }
}

#[async_trait]
impl PermissionGate for DesktopPermissions {
    fn is_authorized(&self, capability: Capability) -> bool {
        !self.withheld.contains(&capability)
    }

    async fn request_authorization(&self, capability: Capability) -> bool {
        if self.withheld.contains(&capability) {
            warn!("{} capability withheld on the command line", capability);
            return false;
        }
        debug!("{} capability granted by the OS", capability);
        true
    }
}
