// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A reference-counted, lock-protected translation layer for callers that
//! can't thread a `&mut Ftl` through, such as several tasks sharing one
//! flash part.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::low_level::Flash;
use crate::{Config, Error, Ftl};

/// Shared handle to a device and the translation layer over it.
///
/// The layer is opened by the first `init` and closed by the matching last
/// `release`. In between, every call holds the lock for its full duration,
/// so operations from different users never interleave.
pub struct SharedFtl<M: RawMutex, F: Flash> {
    inner: Mutex<M, RefCell<Slot<F>>>,
}

struct Slot<F: Flash> {
    refs: u32,
    config: Config,
    /// The device while closed.
    flash: Option<F>,
    ftl: Option<Ftl<F>>,
}

impl<M: RawMutex, F: Flash> SharedFtl<M, F> {
    pub const fn new(flash: F, config: Config) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Slot {
                refs: 0,
                config,
                flash: Some(flash),
                ftl: None,
            })),
        }
    }

    /// Takes a reference, opening the layer if this is the first one.
    /// Returns the size of the logical space.
    pub fn init(&self) -> Result<u32, Error<F::Error>> {
        self.inner.lock(|cell| {
            let mut guard = cell.borrow_mut();
            let slot = &mut *guard;
            if let Some(ftl) = &slot.ftl {
                slot.refs += 1;
                return Ok(ftl.logical_size());
            }

            let flash = slot.flash.take()
                .expect("device is held by either the slot or the open layer");
            match Ftl::open(flash, slot.config) {
                Ok(ftl) => {
                    let size = ftl.logical_size();
                    slot.ftl = Some(ftl);
                    slot.refs = 1;
                    Ok(size)
                }
                Err(e) => {
                    let (flash, cause) = e.into_parts();
                    slot.flash = Some(flash);
                    Err(cause)
                }
            }
        })
    }

    /// Drops a reference. The last one flushes and closes the layer, keeping
    /// the device for a later `init`.
    pub fn release(&self) -> Result<(), Error<F::Error>> {
        self.inner.lock(|cell| {
            let mut guard = cell.borrow_mut();
            let slot = &mut *guard;
            if slot.ftl.is_none() {
                return Err(Error::NotOpen);
            }
            slot.refs -= 1;
            if slot.refs > 0 {
                return Ok(());
            }

            let ftl = slot.ftl.take().expect("checked above");
            match ftl.close() {
                Ok(flash) => {
                    slot.flash = Some(flash);
                    Ok(())
                }
                Err(e) => {
                    let (flash, cause) = e.into_parts();
                    slot.flash = Some(flash);
                    Err(cause)
                }
            }
        })
    }

    /// Runs `body` against the open layer with the lock held.
    pub fn with<R>(
        &self,
        body: impl FnOnce(&mut Ftl<F>) -> Result<R, Error<F::Error>>,
    ) -> Result<R, Error<F::Error>> {
        self.inner.lock(|cell| {
            match cell.borrow_mut().ftl.as_mut() {
                Some(ftl) => body(ftl),
                None => Err(Error::NotOpen),
            }
        })
    }

    pub fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), Error<F::Error>> {
        self.with(|ftl| ftl.read(addr, buf))
    }

    pub fn write(&self, addr: u32, data: &[u8]) -> Result<(), Error<F::Error>> {
        self.with(|ftl| ftl.write(addr, data))
    }

    pub fn flush(&self) -> Result<(), Error<F::Error>> {
        self.with(|ftl| ftl.flush())
    }

    /// Consumes the handle and returns the device, without flushing.
    pub fn into_flash(self) -> F {
        let slot = self.inner.into_inner().into_inner();
        match slot.ftl {
            Some(ftl) => ftl.into_flash(),
            None => slot.flash.expect("device is held by either the slot or the open layer"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, NoopRawMutex};
    use crate::fake_flash::FakeFlash;

    #[test]
    fn reference_counting() {
        let shared: SharedFtl<NoopRawMutex, _> = SharedFtl::new(FakeFlash::new(5, 8), Config::default());
        assert_eq!(shared.flush(), Err(Error::NotOpen));
        assert_eq!(shared.release(), Err(Error::NotOpen));

        let size = shared.init().unwrap();
        assert_eq!(size, 3 * 8 * 505);
        assert_eq!(shared.init(), Ok(size));
        shared.write(10, b"hello").unwrap();

        shared.release().unwrap();
        // Still open for the other user.
        let mut buf = [0; 5];
        shared.read(10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        shared.release().unwrap();
        assert_eq!(shared.read(10, &mut buf), Err(Error::NotOpen));

        // The last release flushed, so the data survives a fresh open.
        assert_eq!(shared.init(), Ok(size));
        buf.fill(0);
        shared.read(10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn failed_init_keeps_device() {
        let config = Config { physical_blocks: 10, ..Config::default() };
        let shared: SharedFtl<NoopRawMutex, _> = SharedFtl::new(FakeFlash::new(5, 8), config);
        assert_eq!(shared.init(), Err(Error::InvalidArgument));
        assert_eq!(shared.init(), Err(Error::InvalidArgument));
        assert_eq!(shared.into_flash().program_count(), 0);
    }

    #[test]
    fn concurrent_users() {
        const USERS: u32 = 4;
        const CHUNK: u32 = 1000;

        let shared: SharedFtl<CriticalSectionRawMutex, _> =
            SharedFtl::new(FakeFlash::new(10, 8), Config::default());
        let size = shared.init().unwrap();
        assert!(USERS * CHUNK * 4 <= size);

        std::thread::scope(|s| {
            for user in 0..USERS {
                let shared = &shared;
                s.spawn(move || {
                    shared.init().unwrap();
                    let base = user * CHUNK * 4;
                    for round in 0..4 {
                        let data = vec![(user * 16 + round) as u8; CHUNK as usize];
                        shared.write(base + round * CHUNK, &data).unwrap();
                    }
                    shared.release().unwrap();
                });
            }
        });

        for user in 0..USERS {
            for round in 0..4 {
                let mut buf = vec![0; CHUNK as usize];
                shared.read(user * CHUNK * 4 + round * CHUNK, &mut buf).unwrap();
                assert!(buf.iter().all(|&b| b == (user * 16 + round) as u8));
            }
        }
        shared.with(|ftl| {
            assert!(ftl.census().log_blocks <= 2);
            Ok(())
        }).unwrap();
        shared.release().unwrap();
    }
}
