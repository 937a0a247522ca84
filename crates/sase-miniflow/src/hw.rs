//! Hardware flow installer seam

use std::time::Instant;

use crate::error::HwError;
use crate::merge::MergedArtifact;
use crate::rules::CounterId;

/// Opaque handle of an installed hardware rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HwHandle(pub u64);

/// Device a merged flow is installed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstallTarget {
    /// The device the chain was classified on
    Primary,
    /// The paired device of a bonded/dual-port setup
    Peer,
}

/// Hardware programming collaborator
///
/// Calls may block on the device. Workers and the aging loop invoke them
/// from tokio's blocking pool.
pub trait FlowInstaller: Send + Sync {
    /// Program one merged rule
    fn install(&self, artifact: &MergedArtifact, target: InstallTarget) -> Result<HwHandle, HwError>;

    /// Remove a rule previously returned by `install`
    fn uninstall(&self, handle: HwHandle) -> Result<(), HwError>;

    /// Whether the artifact must also be programmed on the peer device
    fn needs_peer(&self, _artifact: &MergedArtifact) -> bool {
        false
    }

    /// Make hits on `handle` also count towards the constituent counters
    fn link_counters(&self, handle: HwHandle, counters: &[CounterId]);

    /// Undo `link_counters`
    fn unlink_counters(&self, handle: HwHandle);

    /// Last time the device saw traffic on `handle`
    fn last_use(&self, handle: HwHandle) -> Option<Instant>;
}

/// Hardware rules backing one merged flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwBinding {
    /// Rule on the primary device
    pub primary: HwHandle,
    /// Rule on the peer device
    pub peer: Option<HwHandle>,
}

impl HwBinding {
    /// All handles, primary first
    pub fn handles(&self) -> impl Iterator<Item = HwHandle> {
        std::iter::once(self.primary).chain(self.peer)
    }

    /// Most recent use across both devices
    pub fn last_use(&self, installer: &dyn FlowInstaller) -> Option<Instant> {
        self.handles().filter_map(|h| installer.last_use(h)).max()
    }
}
