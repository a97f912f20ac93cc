//! Access to the faulting thread's address space.
//!
//! The emulator never touches guest memory directly, it goes through
//! [`Memory`], which the host implements with whatever copy primitive it has.
//! [`MMU`] is a very strict flat implementation with per byte permissions,
//! handy for sandboxes and tests.

use thiserror::Error;

use crate::primitive::Primitive;

type Result<T> = std::result::Result<T, AccessError>;

/// Reads and writes in the address space of the faulting thread.
pub trait Memory {
    /// read `buf.len()` bytes starting at `addr`
    fn read_to(&mut self, addr: Virtaddr, buf: &mut [u8]) -> Result<()>;

    /// write `buf` starting at `addr`
    fn write_from(&mut self, addr: Virtaddr, buf: &[u8]) -> Result<()>;

    /// read instruction bytes, hosts that track execute permission override this
    fn fetch(&mut self, addr: Virtaddr, buf: &mut [u8]) -> Result<()> {
        self.read_to(addr, buf)
    }

    /// read a little endian primitive
    fn read_primitive<T: Primitive<N>, const N: usize>(&mut self, addr: Virtaddr) -> Result<T> {
        let mut buf = [0u8; N];
        self.read_to(addr, &mut buf)?;
        Ok(T::from_le_bytes(buf))
    }

    /// write a little endian primitive
    fn write_primitive<T: Primitive<N>, const N: usize>(
        &mut self,
        addr: Virtaddr,
        value: T,
    ) -> Result<()> {
        self.write_from(addr, &value.to_le_bytes())
    }
}

pub struct MMU {
    memory: Vec<u8>,
    permissions: Vec<Perm>,
}

impl MMU {
    /// an address space of `size` bytes starting at zero, nothing mapped
    pub fn new(size: usize) -> Self {
        Self {
            memory: vec![0; size],
            permissions: vec![Perm(0); size],
        }
    }

    /// turn a guest address range into a range of our buffers
    #[inline]
    fn region(&self, addr: Virtaddr, size: usize) -> Result<core::ops::Range<usize>> {
        let start = usize::try_from(addr.0).map_err(|_| AccessError::AddrOOB(addr))?;
        let Some(end) = start.checked_add(size) else {
            return Err(AccessError::AddrOverflow(addr));
        };
        if end > self.memory.len() {
            return Err(AccessError::AddrOOB(addr));
        }
        Ok(start..end)
    }

    /// check that every byte of the range carries all of `exp_perms`
    #[inline]
    fn check_perms(
        &self,
        addr: Virtaddr,
        size: usize,
        exp_perms: Perm,
    ) -> Result<core::ops::Range<usize>> {
        let range = self.region(addr, size)?;
        if let Some(offset) = self.permissions[range.clone()]
            .iter()
            .position(|&perm| perm & exp_perms != exp_perms)
        {
            let at = range.start + offset;
            return Err(AccessError::PermErr(Virtaddr(at as u64), self.permissions[at]));
        }
        Ok(range)
    }

    /// write a buffer to a virtual address, checking if we have the given permissions
    pub fn write_from_perms(&mut self, addr: Virtaddr, buf: &[u8], exp_perms: Perm) -> Result<()> {
        let range = self.check_perms(addr, buf.len(), exp_perms)?;
        self.memory[range].copy_from_slice(buf);
        Ok(())
    }

    /// read from a virtual address to a buffer, checking if we have the given permissions
    pub fn read_to_perms(&self, addr: Virtaddr, buf: &mut [u8], exp_perms: Perm) -> Result<()> {
        let range = self.check_perms(addr, buf.len(), exp_perms)?;
        buf.copy_from_slice(&self.memory[range]);
        Ok(())
    }

    /// copy bytes in without looking at permissions, for setting up code and data
    pub fn load(&mut self, addr: Virtaddr, buf: &[u8]) -> Result<()> {
        let range = self.region(addr, buf.len())?;
        self.memory[range].copy_from_slice(buf);
        Ok(())
    }

    /// set the permissions specified in `perms` to a memory segment of size `size`
    /// at the the virtual address located at `addr`
    pub fn set_permissions(&mut self, addr: Virtaddr, size: usize, perms: Perm) -> Result<()> {
        // nothing to do, just continue
        if size == 0 {
            return Ok(());
        }
        let range = self.region(addr, size)?;
        self.permissions[range].iter_mut().for_each(|x| *x = perms);
        Ok(())
    }
}

impl Memory for MMU {
    fn read_to(&mut self, addr: Virtaddr, buf: &mut [u8]) -> Result<()> {
        self.read_to_perms(addr, buf, PERM_READ)
    }

    fn write_from(&mut self, addr: Virtaddr, buf: &[u8]) -> Result<()> {
        self.write_from_perms(addr, buf, PERM_WRITE)
    }

    fn fetch(&mut self, addr: Virtaddr, buf: &mut [u8]) -> Result<()> {
        self.read_to_perms(addr, buf, PERM_EXEC)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Virtaddr(pub u64);

impl core::fmt::LowerHex for Virtaddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::LowerHex::fmt(&self.0, f)
    }
}

/// error type for memory access operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AccessError {
    /// We had an overflow when trying to get
    /// the end of the region to access
    #[error("address range starting at {0:#x} overflows")]
    AddrOverflow(Virtaddr),
    /// We tried to access past the memory buffer
    #[error("address {0:#x} is outside of the address space")]
    AddrOOB(Virtaddr),
    /// We tried to access memory without the
    /// needed permissions
    #[error("address {0:#x} has permissions {1:?}")]
    PermErr(Virtaddr, Perm),
    /// The host's copy primitive reported the page as unmapped
    #[error("address {0:#x} is not mapped")]
    Unmapped(Virtaddr),
}

impl AccessError {
    /// the address the access failed at
    pub fn address(&self) -> Virtaddr {
        match *self {
            AccessError::AddrOverflow(addr)
            | AccessError::AddrOOB(addr)
            | AccessError::PermErr(addr, _)
            | AccessError::Unmapped(addr) => addr,
        }
    }
}

#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Perm(pub u8);

/// permission to read a byte in memory
pub const PERM_READ: Perm = Perm(1 << 2);
/// permission to write a byte in memory
pub const PERM_WRITE: Perm = Perm(1 << 1);
/// permission to execute a byte in memory
pub const PERM_EXEC: Perm = Perm(1 << 0);

impl std::ops::BitOr for Perm {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}
impl std::ops::BitAnd for Perm {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_need_read_permission() {
        let mut mmu = MMU::new(0x2000);
        mmu.load(Virtaddr(0x1000), &[1, 2, 3, 4]).unwrap();
        assert_eq!(
            mmu.read_primitive::<u32, 4>(Virtaddr(0x1000)),
            Err(AccessError::PermErr(Virtaddr(0x1000), Perm(0)))
        );

        mmu.set_permissions(Virtaddr(0x1000), 4, PERM_READ).unwrap();
        assert_eq!(mmu.read_primitive::<u32, 4>(Virtaddr(0x1000)), Ok(0x0403_0201));
    }

    #[test]
    fn partial_permission_reports_first_bad_byte() {
        let mut mmu = MMU::new(0x2000);
        mmu.set_permissions(Virtaddr(0x1000), 8, PERM_READ).unwrap();
        let err = mmu.read_primitive::<u128, 16>(Virtaddr(0x1000)).unwrap_err();
        assert_eq!(err, AccessError::PermErr(Virtaddr(0x1008), Perm(0)));
    }

    #[test]
    fn out_of_bounds_and_overflow() {
        let mut mmu = MMU::new(0x100);
        let mut buf = [0u8; 8];
        assert_eq!(
            mmu.read_to(Virtaddr(0xfc), &mut buf),
            Err(AccessError::AddrOOB(Virtaddr(0xfc)))
        );
        assert!(mmu.read_to(Virtaddr(u64::MAX), &mut buf).is_err());
    }

    #[test]
    fn writes_need_write_permission() {
        let mut mmu = MMU::new(0x100);
        mmu.set_permissions(Virtaddr(0x10), 8, PERM_READ).unwrap();
        assert!(mmu.write_primitive::<u64, 8>(Virtaddr(0x10), 5).is_err());

        mmu.set_permissions(Virtaddr(0x10), 8, PERM_READ | PERM_WRITE).unwrap();
        mmu.write_primitive::<u64, 8>(Virtaddr(0x10), 5).unwrap();
        assert_eq!(mmu.read_primitive::<u64, 8>(Virtaddr(0x10)), Ok(5));
    }

    #[test]
    fn fetch_needs_exec_permission() {
        let mut mmu = MMU::new(0x100);
        mmu.load(Virtaddr(0x20), &[0xc4, 0xe2]).unwrap();
        mmu.set_permissions(Virtaddr(0x20), 2, PERM_READ).unwrap();
        let mut buf = [0u8; 2];
        assert!(mmu.fetch(Virtaddr(0x20), &mut buf).is_err());

        mmu.set_permissions(Virtaddr(0x20), 2, PERM_READ | PERM_EXEC).unwrap();
        mmu.fetch(Virtaddr(0x20), &mut buf).unwrap();
        assert_eq!(buf, [0xc4, 0xe2]);
    }
}
