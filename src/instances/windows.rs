//! Named-mutex slots on Windows, including forced release of another
//! process's slot handles via handle duplication.

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr;

use log::{debug, warn};
use windows_sys::Win32::Foundation::{
    CloseHandle, DUPLICATE_CLOSE_SOURCE, DUPLICATE_SAME_ACCESS, DuplicateHandle,
    ERROR_ACCESS_DENIED, GetLastError, HANDLE,
};
use windows_sys::Win32::System::Threading::{
    GetCurrentProcess, OpenMutexW, OpenProcess, PROCESS_DUP_HANDLE,
    SYNCHRONIZATION_SYNCHRONIZE,
};

use super::InstanceSlots;
use crate::error::{CloneError, Result};

const SYSTEM_EXTENDED_HANDLE_INFORMATION: u32 = 64;
const OBJECT_NAME_INFORMATION: u32 = 1;
const OBJECT_TYPE_INFORMATION: u32 = 2;
const STATUS_INFO_LENGTH_MISMATCH: i32 = 0xC000_0004_u32 as i32;
const MUTANT_TYPE: &str = "Mutant";

#[repr(C)]
struct HandleEntry {
    object: *mut c_void,
    unique_process_id: usize,
    handle_value: usize,
    granted_access: u32,
    creator_back_trace_index: u16,
    object_type_index: u16,
    handle_attributes: u32,
    reserved: u32,
}

#[repr(C)]
struct HandleInformationHeader {
    number_of_handles: usize,
    reserved: usize,
}

#[repr(C)]
struct UnicodeString {
    length: u16,
    maximum_length: u16,
    buffer: *const u16,
}

#[link(name = "ntdll")]
unsafe extern "system" {
    fn NtQuerySystemInformation(
        class: u32,
        info: *mut c_void,
        length: u32,
        return_length: *mut u32,
    ) -> i32;

    fn NtQueryObject(
        handle: HANDLE,
        class: u32,
        info: *mut c_void,
        length: u32,
        return_length: *mut u32,
    ) -> i32;
}

/// Slots are the client's named mutexes, held by whichever client processes are running.
pub struct NamedMutexSlots {
    /// Restrict force release to one process; `None` searches every process.
    target_pid: Option<u32>,
}

impl NamedMutexSlots {
    pub fn system_wide() -> Self {
        Self { target_pid: None }
    }

    pub fn for_process(pid: u32) -> Self {
        Self {
            target_pid: Some(pid),
        }
    }

    fn targets(&self, owner_pid: usize) -> bool {
        self.target_pid.is_none_or(|pid| pid as usize == owner_pid)
    }
}

/// `PROCESS_DUP_HANDLE` handles opened lazily, one per owning process.
struct OwnerProcesses {
    opened: HashMap<usize, HANDLE>,
}

impl OwnerProcesses {
    fn new() -> Self {
        Self {
            opened: HashMap::new(),
        }
    }

    fn get(&mut self, pid: usize) -> Option<HANDLE> {
        let handle = *self
            .opened
            .entry(pid)
            .or_insert_with(|| unsafe { OpenProcess(PROCESS_DUP_HANDLE, 0, pid as u32) });
        (!handle.is_null()).then_some(handle)
    }
}

impl Drop for OwnerProcesses {
    fn drop(&mut self) {
        for handle in self.opened.values().filter(|h| !h.is_null()) {
            unsafe { CloseHandle(*handle) };
        }
    }
}

fn wide(name: &str) -> Vec<u16> {
    name.encode_utf16().chain(std::iter::once(0)).collect()
}

impl InstanceSlots for NamedMutexSlots {
    fn slot_exists(&self, name: &str) -> bool {
        let name = wide(name);
        let handle = unsafe { OpenMutexW(SYNCHRONIZATION_SYNCHRONIZE, 0, name.as_ptr()) };
        if handle.is_null() {
            return unsafe { GetLastError() } == ERROR_ACCESS_DENIED;
        }
        unsafe { CloseHandle(handle) };
        true
    }

    fn supports_force_release(&self) -> bool {
        true
    }

    fn force_release(&self, suffixes: &[String]) -> Result<usize> {
        self.release_matching(suffixes)
    }
}

impl NamedMutexSlots {
    fn release_matching(&self, suffixes: &[String]) -> Result<usize> {
        let current_pid = std::process::id() as usize;
        let mut owners = OwnerProcesses::new();
        let table = query_handle_table()?;
        let header = table.as_ptr() as *const HandleInformationHeader;
        let count = unsafe { (*header).number_of_handles };
        let entries = unsafe { header.add(1) as *const HandleEntry };
        let available = (table.len() * 8 - size_of::<HandleInformationHeader>()) / size_of::<HandleEntry>();
        let count = count.min(available);

        let mut closed = 0;
        for i in 0..count {
            let entry = unsafe { &*entries.add(i) };
            let owner = entry.unique_process_id;
            if owner == current_pid || !self.targets(owner) {
                continue;
            }
            let Some(process) = owners.get(owner) else {
                continue;
            };
            let remote = entry.handle_value as HANDLE;
            let Some(name) = mutant_name(process, remote) else {
                continue;
            };
            if !suffixes.iter().any(|s| name.ends_with(s.as_str())) {
                continue;
            }
            let ok = unsafe {
                DuplicateHandle(
                    process,
                    remote,
                    ptr::null_mut(),
                    ptr::null_mut(),
                    0,
                    0,
                    DUPLICATE_CLOSE_SOURCE,
                )
            };
            if ok != 0 {
                debug!("instances: closed mutex {name}");
                closed += 1;
            } else {
                warn!("instances: could not close {name} (error {})", unsafe { GetLastError() });
            }
        }
        Ok(closed)
    }
}

/// Snapshot of the system handle table, u64-aligned.
fn query_handle_table() -> Result<Vec<u64>> {
    let mut words: usize = 64 * 1024;
    loop {
        let mut buf = vec![0u64; words];
        let mut needed = 0u32;
        let status = unsafe {
            NtQuerySystemInformation(
                SYSTEM_EXTENDED_HANDLE_INFORMATION,
                buf.as_mut_ptr().cast(),
                (words * 8) as u32,
                &mut needed,
            )
        };
        if status == STATUS_INFO_LENGTH_MISMATCH {
            words = (needed as usize / 8).max(words * 2);
            continue;
        }
        if status < 0 {
            return Err(CloneError::InstanceSlots(format!(
                "handle enumeration failed (status {status:#x})"
            )));
        }
        return Ok(buf);
    }
}

/// Name of a remote handle if it is a mutant; `None` for everything else.
fn mutant_name(process: HANDLE, remote: HANDLE) -> Option<String> {
    let mut local: HANDLE = ptr::null_mut();
    let ok = unsafe {
        DuplicateHandle(
            process,
            remote,
            GetCurrentProcess(),
            &mut local,
            0,
            0,
            DUPLICATE_SAME_ACCESS,
        )
    };
    if ok == 0 {
        return None;
    }
    // Querying names of some handle types (pipes) can block, so check the type first.
    let name = query_object_string(local, OBJECT_TYPE_INFORMATION)
        .filter(|ty| ty == MUTANT_TYPE)
        .and_then(|_| query_object_string(local, OBJECT_NAME_INFORMATION));
    unsafe { CloseHandle(local) };
    name.filter(|n| !n.is_empty())
}

fn query_object_string(handle: HANDLE, class: u32) -> Option<String> {
    let mut buf = vec![0u64; 256];
    let mut needed = 0u32;
    let mut status = unsafe {
        NtQueryObject(handle, class, buf.as_mut_ptr().cast(), (buf.len() * 8) as u32, &mut needed)
    };
    if status == STATUS_INFO_LENGTH_MISMATCH && needed > 0 {
        buf = vec![0u64; (needed as usize).div_ceil(8)];
        status = unsafe {
            NtQueryObject(handle, class, buf.as_mut_ptr().cast(), (buf.len() * 8) as u32, &mut needed)
        };
    }
    if status < 0 {
        return None;
    }
    let text = unsafe { &*(buf.as_ptr() as *const UnicodeString) };
    if text.buffer.is_null() || text.length == 0 {
        return Some(String::new());
    }
    let chars = unsafe { std::slice::from_raw_parts(text.buffer, text.length as usize / 2) };
    Some(String::from_utf16_lossy(chars))
}
