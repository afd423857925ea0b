// Copyright 2025 the oxserver authors
//
// SPDX-License-Identifier: MIT

//! The device model handed to us by the enumeration subsystem. Drivers and
//! input polling live out-of-tree; the server only needs a stable snapshot
//! of what exists so it can publish the shared catalogue and answer device
//! state requests.

use glam::{Quat, Vec3};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Device slots the server will track. Slot 0 must hold the HMD.
pub const MAX_DEVICES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub orientation: Quat,
    pub position: Vec3,
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        orientation: Quat::IDENTITY,
        position: Vec3::ZERO,
    };
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Half-angles in radians, matching the sign conventions of the client API
/// (left and down are negative).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Fov {
    pub angle_left: f32,
    pub angle_right: f32,
    pub angle_up: f32,
    pub angle_down: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum OriginKind {
    Other = 0,
    Imu = 1,
    Lighthouse = 2,
    Simulated = 3,
}

/// A named 6-DoF reference frame shared by one or more devices.
#[derive(Debug, Clone)]
pub struct TrackingOrigin {
    pub name: String,
    pub kind: OriginKind,
    pub offset: Pose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum DeviceName {
    Unknown = 0,
    SimulatedHmd = 1,
    SimulatedController = 2,
    GenericHmd = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum InputId {
    HeadPose = 1,
    AimPose = 2,
    GripPose = 3,
    TriggerValue = 4,
    SqueezeValue = 5,
    ThumbstickXy = 6,
    SelectClick = 7,
    MenuClick = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum OutputId {
    Haptic = 1,
}

#[derive(Debug, Clone, Copy)]
pub struct InputRecord {
    pub id: InputId,
}

#[derive(Debug, Clone, Copy)]
pub struct OutputRecord {
    pub id: OutputId,
}

/// Per-eye display dimensions and field of view.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisplayView {
    pub width: u32,
    pub height: u32,
    pub fov: Fov,
}

#[derive(Debug, Clone, Copy)]
pub struct HmdSpec {
    pub views: [DisplayView; 2],
    pub refresh_rate_hz: f32,
}

#[derive(Debug, Clone)]
pub struct Device {
    pub name: DeviceName,
    /// A short stable identifier, e.g. a serial number.
    pub ident: String,
    /// Index into [`DeviceCatalogue::origins`]. Devices never point at
    /// origins directly; the index survives the trip through shared memory.
    pub tracking_origin: usize,
    pub hmd: Option<HmdSpec>,
    pub inputs: Vec<InputRecord>,
    pub outputs: Vec<OutputRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceCatalogue {
    pub origins: Vec<TrackingOrigin>,
    pub devices: Vec<Device>,
}

impl DeviceCatalogue {
    pub fn hmd(&self) -> Option<&Device> {
        self.devices.first().filter(|d| d.hmd.is_some())
    }

    /// Checks the startup requirements: a bounded device list with an HMD
    /// in slot 0, and every origin reference in range.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.devices.len() > MAX_DEVICES {
            anyhow::bail!("{} devices selected, max is {}", self.devices.len(), MAX_DEVICES);
        }

        if self.hmd().is_none() {
            anyhow::bail!("no HMD in device slot 0");
        }

        for dev in &self.devices {
            if dev.tracking_origin >= self.origins.len() {
                anyhow::bail!(
                    "device {:?} references tracking origin {} (have {})",
                    dev.ident,
                    dev.tracking_origin,
                    self.origins.len()
                );
            }
        }

        Ok(())
    }
}

const SIMULATED_VIEW: DisplayView = DisplayView {
    width: 1600,
    height: 1600,
    fov: Fov {
        angle_left: -0.942,
        angle_right: 0.942,
        angle_up: 0.942,
        angle_down: -0.942,
    },
};

/// A deterministic catalogue used when no hardware drivers are selected:
/// one HMD and two controllers sharing a single simulated tracker.
pub fn simulated() -> DeviceCatalogue {
    let origins = vec![TrackingOrigin {
        name: "Simulated Tracker".to_string(),
        kind: OriginKind::Simulated,
        offset: Pose::IDENTITY,
    }];

    let hmd = Device {
        name: DeviceName::SimulatedHmd,
        ident: "OXSIM-HMD-0".to_string(),
        tracking_origin: 0,
        hmd: Some(HmdSpec {
            views: [SIMULATED_VIEW; 2],
            refresh_rate_hz: 90.0,
        }),
        inputs: vec![InputRecord { id: InputId::HeadPose }],
        outputs: Vec::new(),
    };

    let controller = |n: u32| Device {
        name: DeviceName::SimulatedController,
        ident: format!("OXSIM-CTRL-{n}"),
        tracking_origin: 0,
        hmd: None,
        inputs: vec![
            InputRecord { id: InputId::AimPose },
            InputRecord { id: InputId::GripPose },
            InputRecord { id: InputId::TriggerValue },
            InputRecord { id: InputId::SqueezeValue },
            InputRecord { id: InputId::ThumbstickXy },
            InputRecord { id: InputId::SelectClick },
            InputRecord { id: InputId::MenuClick },
        ],
        outputs: vec![OutputRecord { id: OutputId::Haptic }],
    };

    DeviceCatalogue {
        origins,
        devices: vec![hmd, controller(0), controller(1)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_catalogue_is_valid() {
        let catalogue = simulated();
        catalogue.validate().unwrap();

        let hmd = catalogue.hmd().unwrap();
        assert_eq!(hmd.name, DeviceName::SimulatedHmd);
        assert_eq!(hmd.hmd.unwrap().views[0].width, 1600);
        assert_eq!(catalogue.devices.len(), 3);
    }

    #[test]
    fn controllers_share_the_tracker() {
        let catalogue = simulated();
        let origins: Vec<_> = catalogue.devices.iter().map(|d| d.tracking_origin).collect();
        assert_eq!(origins, vec![0, 0, 0]);
    }
}
