//! Native thread handles and OS-visible thread names.

use std::ffi::{CStr, CString};

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub type NativeHandle = libc::pthread_t;

        pub fn current_native_handle() -> NativeHandle {
            unsafe { libc::pthread_self() }
        }

        pub fn is_current(handle: NativeHandle) -> bool {
            unsafe { libc::pthread_equal(handle, libc::pthread_self()) != 0 }
        }
    } else if #[cfg(windows)] {
        pub type NativeHandle = winapi::shared::minwindef::DWORD;

        pub fn current_native_handle() -> NativeHandle {
            unsafe { winapi::um::processthreadsapi::GetCurrentThreadId() }
        }

        pub fn is_current(handle: NativeHandle) -> bool {
            handle == current_native_handle()
        }
    } else {
        pub type NativeHandle = std::thread::ThreadId;

        pub fn current_native_handle() -> NativeHandle {
            std::thread::current().id()
        }

        pub fn is_current(handle: NativeHandle) -> bool {
            handle == current_native_handle()
        }
    }
}

/// Longest name (in bytes, without the terminator) the OS keeps for a thread.
const OS_NAME_MAX: usize = 15;

fn os_name(name: &str) -> Option<CString> {
    let mut end = name.len().min(OS_NAME_MAX);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    CString::new(&name[..end]).ok()
}

cfgenius::cond! {
    if macro(crate::macros::linux_like) {
        fn setname(name: &CStr) -> i32 {
            unsafe { libc::pthread_setname_np(libc::pthread_self(), name.as_ptr()) }
        }
    } else if macro(crate::macros::darwin) {
        fn setname(name: &CStr) -> i32 {
            unsafe { libc::pthread_setname_np(name.as_ptr()) }
        }
    } else {
        fn setname(_name: &CStr) -> i32 {
            0
        }
    }
}

/// Best-effort rename of the calling native thread. Failures are logged and
/// otherwise ignored.
pub fn set_current_os_name(name: &str) {
    let Some(cname) = os_name(name) else {
        log::debug!("thread name {name:?} cannot be passed to the OS");
        return;
    };

    let rc = setname(&cname);
    if rc != 0 {
        log::debug!("pthread_setname_np({name:?}) failed: {}", errno::Errno(rc));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_names_are_truncated_on_char_boundaries() {
        assert_eq!(os_name("short").unwrap().to_str().unwrap(), "short");
        assert_eq!(
            os_name("a-very-long-thread-name").unwrap().to_str().unwrap(),
            "a-very-long-thr"
        );
        // 14 ASCII bytes followed by a two byte character straddling the limit.
        assert_eq!(
            os_name("abcdefghijklmné").unwrap().to_str().unwrap(),
            "abcdefghijklmn"
        );
        assert!(os_name("nul\0inside").is_none());
    }

    #[test]
    fn current_handle_is_current() {
        let handle = current_native_handle();
        assert!(is_current(handle));
        let other = std::thread::spawn(current_native_handle).join().unwrap();
        assert!(!is_current(other));
    }
}
