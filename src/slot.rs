//! A/B slot model and active-slot detection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const LABEL_A: &str = "rootfsA";
pub const LABEL_B: &str = "rootfsB";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn other(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Slot::A => "A",
            Slot::B => "B",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device node and partition label backing one slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotBinding {
    pub device: PathBuf,
    pub label: String,
}

impl SlotBinding {
    pub fn new(device: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            label: label.into(),
        }
    }
}

/// Bindings for both slots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotLayout {
    pub a: SlotBinding,
    pub b: SlotBinding,
}

impl SlotLayout {
    /// eMMC board: `/dev/mmcblk0p2` / `/dev/mmcblk0p3`
    pub fn board() -> Self {
        Self {
            a: SlotBinding::new("/dev/mmcblk0p2", LABEL_A),
            b: SlotBinding::new("/dev/mmcblk0p3", LABEL_B),
        }
    }

    /// virtio disk under QEMU: `/dev/vda2` / `/dev/vda3`
    pub fn qemu() -> Self {
        Self {
            a: SlotBinding::new("/dev/vda2", LABEL_A),
            b: SlotBinding::new("/dev/vda3", LABEL_B),
        }
    }

    /// Built-in layout by name.
    pub fn named(name: &str) -> Option<Self> {
        match name {
            "board" => Some(Self::board()),
            "qemu" => Some(Self::qemu()),
            _ => None,
        }
    }

    pub fn binding(&self, slot: Slot) -> &SlotBinding {
        match slot {
            Slot::A => &self.a,
            Slot::B => &self.b,
        }
    }

    fn slot_for_label(&self, label: &str) -> Option<Slot> {
        if label == self.a.label {
            Some(Slot::A)
        } else if label == self.b.label {
            Some(Slot::B)
        } else {
            None
        }
    }

    fn slot_for_device(&self, device: &Path) -> Option<Slot> {
        if device == self.a.device {
            Some(Slot::A)
        } else if device == self.b.device {
            Some(Slot::B)
        } else {
            None
        }
    }
}

/// What one apply run will do. Computed fresh per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub active: Slot,
    pub target: Slot,
    pub target_device: PathBuf,
    pub target_label: String,
}

/// Determine the running slot from kernel boot parameters.
///
/// Looks at the last `root=` token. Tries partition labels, then the
/// configured device paths, then the device paths of the built-in layouts,
/// so both physical naming schemes are recognised.
pub fn detect_active_slot(cmdline: &str, layout: &SlotLayout) -> Option<Slot> {
    let root = cmdline
        .split_whitespace()
        .filter_map(|token| token.strip_prefix("root="))
        .last()?;

    if let Some(label) = root.strip_prefix("PARTLABEL=") {
        return layout.slot_for_label(label);
    }

    let device = Path::new(root);
    layout
        .slot_for_device(device)
        .or_else(|| SlotLayout::board().slot_for_device(device))
        .or_else(|| SlotLayout::qemu().slot_for_device(device))
}

/// Target the slot that is not running.
pub fn build_plan(active: Slot, layout: &SlotLayout) -> Plan {
    let target = active.other();
    let binding = layout.binding(target);
    Plan {
        active,
        target,
        target_device: binding.device.clone(),
        target_label: binding.label.clone(),
    }
}
