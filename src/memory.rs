use std::collections::BTreeMap;

use crate::error::Status;

/// Read access to the machine's address space.
///
/// The unwinder only ever reads through this trait, so tests can run it
/// against any backing store that can produce bytes for an address range.
pub trait MemorySource {
    /// Read up to `len` bytes, and stop at the first failure.
    fn read_raw_memory(&self, address: u64, len: usize) -> Result<Vec<u8>, Status>;

    fn read_memory_array<T: Sized + Default + Copy>(
        &self,
        address: u64,
        max_count: usize,
    ) -> Result<Vec<T>, Status> {
        let element_size = ::core::mem::size_of::<T>();
        let max_bytes = max_count * element_size;
        let raw_bytes = self.read_raw_memory(address, max_bytes)?;
        let mut data: Vec<T> = Vec::with_capacity(max_count);
        let mut offset: usize = 0;
        while offset + element_size <= raw_bytes.len() {
            let mut item: T = T::default();
            let dst = &mut item as *mut T as *mut u8;
            let src = &raw_bytes[offset] as *const u8;
            unsafe { std::ptr::copy_nonoverlapping(src, dst, element_size) };
            data.push(item);
            offset += element_size;
        }

        Ok(data)
    }

    fn read_memory_full_array<T: Sized + Default + Copy>(
        &self,
        address: u64,
        count: usize,
    ) -> Result<Vec<T>, Status> {
        let result = self.read_memory_array(address, count)?;
        if result.len() == count {
            Ok(result)
        } else {
            Err(Status::NotEnoughData)
        }
    }

    fn read_memory_data<T: Sized + Default + Copy>(&self, address: u64) -> Result<T, Status> {
        let data = self.read_memory_full_array::<T>(address, 1)?;
        Ok(data[0])
    }
}

/// Sparse, writable address space for a synthetic process.
///
/// Regions are mapped explicitly; anything outside them faults with
/// `Status::AccessViolation`, which is what lets tests place code bytes,
/// unwind info, and stack frames at chosen addresses.
#[derive(Default)]
pub struct MachineMemory {
    regions: BTreeMap<u64, Vec<u8>>,
}

impl MachineMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a zero-filled region at `base`. Overlapping maps are a caller bug.
    pub fn map(&mut self, base: u64, len: usize) {
        self.regions.insert(base, vec![0; len]);
    }

    pub fn map_bytes(&mut self, base: u64, bytes: &[u8]) {
        self.regions.insert(base, bytes.to_vec());
    }

    fn region_for(&self, address: u64) -> Option<(u64, &Vec<u8>)> {
        let (&base, data) = self.regions.range(..=address).next_back()?;
        if address < base + data.len() as u64 {
            Some((base, data))
        } else {
            None
        }
    }

    fn region_for_mut(&mut self, address: u64) -> Option<(u64, &mut Vec<u8>)> {
        let (&base, data) = self.regions.range_mut(..=address).next_back()?;
        if address < base + data.len() as u64 {
            Some((base, data))
        } else {
            None
        }
    }

    pub fn write_bytes(&mut self, address: u64, bytes: &[u8]) -> Result<(), Status> {
        let (base, data) = self
            .region_for_mut(address)
            .ok_or(Status::AccessViolation { address })?;
        let start = (address - base) as usize;
        if start + bytes.len() > data.len() {
            return Err(Status::AccessViolation {
                address: base + data.len() as u64,
            });
        }
        data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn write_u64(&mut self, address: u64, value: u64) -> Result<(), Status> {
        self.write_bytes(address, &value.to_le_bytes())
    }

    pub fn read_u64(&self, address: u64) -> Result<u64, Status> {
        self.read_memory_data::<u64>(address)
    }
}

impl MemorySource for MachineMemory {
    fn read_raw_memory(&self, address: u64, len: usize) -> Result<Vec<u8>, Status> {
        let (base, data) = self
            .region_for(address)
            .ok_or(Status::AccessViolation { address })?;
        let start = (address - base) as usize;
        let end = usize::min(start + len, data.len());
        Ok(data[start..end].to_vec())
    }
}
