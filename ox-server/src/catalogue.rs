// Copyright 2025 the oxserver authors
//
// SPDX-License-Identifier: MIT

//! The shared device catalogue: a fixed-layout snapshot of the device,
//! input, and output tables published once at startup in a POSIX shared
//! memory object. Clients map it read-only through a file descriptor passed
//! during the connection handshake; the name itself is unlinked as soon as
//! the server has mapped it.

use std::{
    num::NonZeroUsize,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    ptr::NonNull,
};

use nix::{
    fcntl::OFlag,
    sys::{
        mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags},
        stat::Mode,
    },
    unistd::ftruncate,
};

use crate::devices::{DeviceCatalogue, Pose, MAX_DEVICES};

pub const SHM_NAME_DEFAULT: &str = "/oxserver_shm";

pub const NAME_LEN: usize = 64;
pub const MAX_INPUTS: usize = 256;
pub const MAX_OUTPUTS: usize = 64;

/// Marks an unresolved tracking-origin reference during population. Never
/// visible to clients.
const ORIGIN_SENTINEL: u32 = u32::MAX;

#[derive(Debug, thiserror::Error)]
pub enum CatalogueInitError {
    #[error("shm_open failed: {0}")]
    ShmOpen(#[source] nix::Error),
    #[error("ftruncate to {1} bytes failed: {0}")]
    Truncate(#[source] nix::Error, usize),
    #[error("mmap failed: {0}")]
    Map(#[source] nix::Error),
    #[error("process-shared semaphore init failed: {0}")]
    Semaphore(#[source] std::io::Error),
    #[error("{0} devices, capacity is {MAX_DEVICES}")]
    TooManyDevices(usize),
    #[error("flat {kind} array exhausted: need {needed}, capacity {capacity}")]
    CapacityExceeded {
        kind: &'static str,
        needed: usize,
        capacity: usize,
    },
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShmPose {
    pub orientation: [f32; 4],
    pub position: [f32; 3],
}

impl From<Pose> for ShmPose {
    fn from(p: Pose) -> Self {
        Self {
            orientation: p.orientation.to_array(),
            position: p.position.to_array(),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ShmFov {
    pub angle_left: f32,
    pub angle_right: f32,
    pub angle_up: f32,
    pub angle_down: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ShmView {
    pub width: u32,
    pub height: u32,
    pub fov: ShmFov,
}

#[repr(C)]
pub struct ShmTrackingOrigin {
    pub name: [u8; NAME_LEN],
    pub kind: u32,
    pub offset: ShmPose,
}

#[repr(C)]
pub struct ShmDevice {
    pub name: u32,
    pub ident: [u8; NAME_LEN],
    /// Index into `itracks`; a dense index, never a pointer.
    pub tracking_origin_index: u32,
    pub hmd_views: [ShmView; 2],
    pub first_input_index: u32,
    pub num_inputs: u32,
    pub first_output_index: u32,
    pub num_outputs: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ShmInput {
    pub id: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ShmOutput {
    pub id: u32,
}

#[repr(C)]
pub struct ShmHmd {
    pub views: [ShmView; 2],
}

#[repr(C)]
pub struct WaitFrameBlock {
    pub sem: libc::sem_t,
}

/// The complete shared-memory layout. Packed, position-stable, and free of
/// pointers; any process that maps the fd sees the same offsets.
#[repr(C)]
pub struct CatalogueLayout {
    pub itracks: [ShmTrackingOrigin; MAX_DEVICES],
    pub num_itracks: u32,
    pub idevs: [ShmDevice; MAX_DEVICES],
    pub num_idevs: u32,
    pub inputs: [ShmInput; MAX_INPUTS],
    pub outputs: [ShmOutput; MAX_OUTPUTS],
    pub hmd: ShmHmd,
    pub wait_frame: WaitFrameBlock,
}

pub const LAYOUT_SIZE: usize = std::mem::size_of::<CatalogueLayout>();

pub struct SharedCatalogue {
    fd: OwnedFd,
    map: NonNull<libc::c_void>,
    owns_sem: bool,
}

// The mapping is plain memory plus a process-shared semaphore; the
// semaphore ops are thread-safe by definition and everything else is
// immutable after build.
unsafe impl Send for SharedCatalogue {}
unsafe impl Sync for SharedCatalogue {}

impl SharedCatalogue {
    /// Allocates, maps, and populates the shared catalogue, then unlinks
    /// the shm name so only fd inheritance can reach it.
    pub fn build(catalogue: &DeviceCatalogue, shm_name: &str) -> Result<Self, CatalogueInitError> {
        if catalogue.devices.len() > MAX_DEVICES {
            return Err(CatalogueInitError::TooManyDevices(catalogue.devices.len()));
        }

        let fd = shm_open(
            shm_name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(CatalogueInitError::ShmOpen)?;

        // The name is gone once we return, whether population succeeded or
        // not. Only the fd remains.
        let name = shm_name.to_owned();
        let _unlink = scopeguard::guard((), move |_| {
            let _ = shm_unlink(name.as_str());
        });

        ftruncate(&fd, LAYOUT_SIZE as libc::off_t)
            .map_err(|e| CatalogueInitError::Truncate(e, LAYOUT_SIZE))?;

        let map = unsafe {
            mmap(
                None,
                NonZeroUsize::new(LAYOUT_SIZE).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
            .map_err(CatalogueInitError::Map)?
        };

        let mut this = Self {
            fd,
            map,
            owns_sem: false,
        };

        // ftruncate gave us zero pages; populate in place.
        let layout = unsafe { &mut *this.map.as_ptr().cast::<CatalogueLayout>() };
        populate(layout, catalogue)?;

        let rc = unsafe { libc::sem_init(&mut layout.wait_frame.sem, 1, 0) };
        if rc != 0 {
            return Err(CatalogueInitError::Semaphore(
                std::io::Error::last_os_error(),
            ));
        }
        this.owns_sem = true;

        Ok(this)
    }

    /// Maps an existing catalogue fd, the way a client would. Does not
    /// initialize or own the semaphore.
    pub fn open(fd: OwnedFd) -> Result<Self, CatalogueInitError> {
        let map = unsafe {
            mmap(
                None,
                NonZeroUsize::new(LAYOUT_SIZE).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
            .map_err(CatalogueInitError::Map)?
        };

        Ok(Self {
            fd,
            map,
            owns_sem: false,
        })
    }

    /// The inheritable fd handed to clients during the handshake.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn size(&self) -> usize {
        LAYOUT_SIZE
    }

    pub fn layout(&self) -> &CatalogueLayout {
        unsafe { &*self.map.as_ptr().cast::<CatalogueLayout>() }
    }

    /// Posts the wait-frame semaphore, releasing a client blocked in its
    /// wait-frame call.
    pub fn post_wait_frame(&self) {
        let sem = &self.layout().wait_frame.sem as *const libc::sem_t as *mut libc::sem_t;
        unsafe {
            libc::sem_post(sem);
        }
    }
}

impl Drop for SharedCatalogue {
    fn drop(&mut self) {
        if self.owns_sem {
            let sem =
                &self.layout().wait_frame.sem as *const libc::sem_t as *mut libc::sem_t;
            unsafe {
                libc::sem_destroy(sem);
            }
        }

        unsafe {
            let _ = munmap(self.map, LAYOUT_SIZE);
        }
    }
}

fn populate(
    layout: &mut CatalogueLayout,
    catalogue: &DeviceCatalogue,
) -> Result<(), CatalogueInitError> {
    for dev in layout.idevs.iter_mut() {
        dev.tracking_origin_index = ORIGIN_SENTINEL;
    }

    // First sweep: build the dense tracking-origin table. Identity is the
    // source origin slot; each distinct origin lands at the first empty
    // entry of the running table.
    let mut seen: [Option<usize>; MAX_DEVICES] = [None; MAX_DEVICES];
    let mut num_itracks = 0u32;

    for dev in &catalogue.devices {
        if seen.iter().flatten().any(|&o| o == dev.tracking_origin) {
            continue;
        }

        let slot = seen
            .iter()
            .position(Option::is_none)
            .expect("origin table full with devices in range");
        seen[slot] = Some(dev.tracking_origin);

        let origin = &catalogue.origins[dev.tracking_origin];
        let itrack = &mut layout.itracks[slot];
        write_name(&mut itrack.name, &origin.name);
        itrack.kind = origin.kind.into();
        itrack.offset = origin.offset.into();

        num_itracks += 1;
    }

    // Second sweep: device entries, resolving origins by linear search in
    // the running table, and packing inputs/outputs into the flat arrays.
    let mut input_index = 0usize;
    let mut output_index = 0usize;

    for (i, dev) in catalogue.devices.iter().enumerate() {
        let entry = &mut layout.idevs[i];

        entry.name = dev.name.into();
        write_name(&mut entry.ident, &dev.ident);

        entry.tracking_origin_index = seen
            .iter()
            .position(|&o| o == Some(dev.tracking_origin))
            .expect("origin recorded in first sweep") as u32;

        if let Some(hmd) = &dev.hmd {
            for (view, src) in entry.hmd_views.iter_mut().zip(hmd.views.iter()) {
                *view = view_from(src);
            }
        }

        if input_index + dev.inputs.len() > MAX_INPUTS {
            return Err(CatalogueInitError::CapacityExceeded {
                kind: "input",
                needed: input_index + dev.inputs.len(),
                capacity: MAX_INPUTS,
            });
        }

        entry.first_input_index = input_index as u32;
        entry.num_inputs = dev.inputs.len() as u32;
        for input in &dev.inputs {
            layout.inputs[input_index] = ShmInput { id: input.id.into() };
            input_index += 1;
        }

        if output_index + dev.outputs.len() > MAX_OUTPUTS {
            return Err(CatalogueInitError::CapacityExceeded {
                kind: "output",
                needed: output_index + dev.outputs.len(),
                capacity: MAX_OUTPUTS,
            });
        }

        entry.first_output_index = output_index as u32;
        entry.num_outputs = dev.outputs.len() as u32;
        for output in &dev.outputs {
            layout.outputs[output_index] = ShmOutput { id: output.id.into() };
            output_index += 1;
        }
    }

    layout.num_itracks = num_itracks;
    layout.num_idevs = catalogue.devices.len() as u32;

    if let Some(hmd) = catalogue.hmd().and_then(|d| d.hmd.as_ref()) {
        layout.hmd.views[0] = view_from(&hmd.views[0]);
        layout.hmd.views[1] = view_from(&hmd.views[1]);
    }

    // Published invariants.
    for entry in layout.idevs.iter().take(layout.num_idevs as usize) {
        assert!(entry.tracking_origin_index != ORIGIN_SENTINEL);
        assert!(entry.tracking_origin_index < layout.num_itracks);
        assert!(entry.first_input_index as usize + entry.num_inputs as usize <= input_index);
        assert!(entry.first_output_index as usize + entry.num_outputs as usize <= output_index);
    }
    assert!(layout.num_itracks as usize <= MAX_DEVICES);

    Ok(())
}

fn view_from(src: &crate::devices::DisplayView) -> ShmView {
    ShmView {
        width: src.width,
        height: src.height,
        fov: ShmFov {
            angle_left: src.fov.angle_left,
            angle_right: src.fov.angle_right,
            angle_up: src.fov.angle_up,
            angle_down: src.fov.angle_down,
        },
    }
}

/// NUL-terminated, truncating copy into a fixed name field.
fn write_name(dst: &mut [u8; NAME_LEN], src: &str) {
    let bytes = src.as_bytes();
    let n = bytes.len().min(NAME_LEN - 1);
    dst[..n].copy_from_slice(&bytes[..n]);
    dst[n..].fill(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices;
    use pretty_assertions::assert_eq;

    fn test_shm_name(tag: &str) -> String {
        format!("/oxserver-test-{}-{}", std::process::id(), tag)
    }

    #[test]
    fn build_and_remap() {
        let catalogue = devices::simulated();
        let shm = SharedCatalogue::build(&catalogue, &test_shm_name("remap")).unwrap();

        let second = SharedCatalogue::open(shm.fd.try_clone().unwrap()).unwrap();
        let a = shm.layout();
        let b = second.layout();

        assert_eq!(a.num_idevs, b.num_idevs);
        assert_eq!(a.num_itracks, b.num_itracks);
        assert_eq!(b.num_idevs, 3);
        assert_eq!(b.num_itracks, 1);

        for i in 0..a.num_idevs as usize {
            assert_eq!(a.idevs[i].name, b.idevs[i].name);
            assert_eq!(a.idevs[i].ident, b.idevs[i].ident);
            assert_eq!(
                a.idevs[i].tracking_origin_index,
                b.idevs[i].tracking_origin_index
            );
        }

        assert_eq!(b.hmd.views[0].width, 1600);
        assert_eq!(b.hmd.views[0].fov, a.hmd.views[0].fov);
    }

    #[test]
    fn name_is_unlinked_after_build() {
        let name = test_shm_name("unlink");
        let _shm = SharedCatalogue::build(&devices::simulated(), &name).unwrap();

        let err = shm_open(name.as_str(), OFlag::O_RDWR, Mode::empty()).unwrap_err();
        assert_eq!(err, nix::Error::ENOENT);
    }

    #[test]
    fn origin_indices_and_ranges() {
        let catalogue = devices::simulated();
        let shm = SharedCatalogue::build(&catalogue, &test_shm_name("ranges")).unwrap();
        let layout = shm.layout();

        let mut total_inputs = 0;
        for i in 0..layout.num_idevs as usize {
            let dev = &layout.idevs[i];
            assert!(dev.tracking_origin_index < layout.num_itracks);

            // Ranges are dense and pairwise non-overlapping.
            assert_eq!(dev.first_input_index, total_inputs);
            total_inputs += dev.num_inputs;
        }

        assert_eq!(total_inputs, 1 + 7 + 7);
        assert_eq!(layout.inputs[0].id, u32::from(devices::InputId::HeadPose));
    }

    #[test]
    fn origins_are_deduplicated() {
        let mut catalogue = devices::simulated();
        catalogue.origins.push(devices::TrackingOrigin {
            name: "Second Tracker".to_string(),
            kind: devices::OriginKind::Simulated,
            offset: devices::Pose::IDENTITY,
        });
        // Move one controller to the new origin.
        catalogue.devices[2].tracking_origin = 1;

        let shm = SharedCatalogue::build(&catalogue, &test_shm_name("dedup")).unwrap();
        let layout = shm.layout();

        assert_eq!(layout.num_itracks, 2);
        assert_eq!(layout.idevs[0].tracking_origin_index, 0);
        assert_eq!(layout.idevs[1].tracking_origin_index, 0);
        assert_eq!(layout.idevs[2].tracking_origin_index, 1);
    }

    #[test]
    fn wait_frame_semaphore_round_trip() {
        let shm =
            SharedCatalogue::build(&devices::simulated(), &test_shm_name("sem")).unwrap();

        shm.post_wait_frame();

        let sem = &shm.layout().wait_frame.sem as *const libc::sem_t as *mut libc::sem_t;
        let rc = unsafe { libc::sem_trywait(sem) };
        assert_eq!(rc, 0);

        // Drained; a second trywait must fail with EAGAIN.
        let rc = unsafe { libc::sem_trywait(sem) };
        assert_eq!(rc, -1);
    }
}
