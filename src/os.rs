//! Thin platform helpers.

/// Runs `f` and restores the calling thread's `errno` afterwards, so the
/// tracking side effects never leak into the intercepted call's error state.
#[inline]
pub(crate) fn preserve_errno<R>(f: impl FnOnce() -> R) -> R {
    let saved = errno::get();
    let result = f();
    errno::set(saved);
    result
}

#[cfg(target_os = "linux")]
mod errno {
    pub fn get() -> i32 {
        unsafe { *libc::__errno_location() }
    }

    pub fn set(value: i32) {
        unsafe { *libc::__errno_location() = value }
    }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
mod errno {
    pub fn get() -> i32 {
        unsafe { *libc::__error() }
    }

    pub fn set(value: i32) {
        unsafe { *libc::__error() = value }
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
mod errno {
    pub fn get() -> i32 {
        0
    }

    pub fn set(_value: i32) {}
}

/// Path of the loaded object (executable or shared library) containing `address`.
#[cfg(unix)]
pub(crate) fn module_of(address: usize) -> Option<String> {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    if unsafe { libc::dladdr(address as *const libc::c_void, &mut info) } == 0
        || info.dli_fname.is_null()
    {
        return None;
    }

    let path = unsafe { std::ffi::CStr::from_ptr(info.dli_fname) }.to_string_lossy();
    let name = path.rsplit('/').next().unwrap_or(&path);
    (!name.is_empty()).then(|| name.to_string())
}

#[cfg(not(unix))]
pub(crate) fn module_of(_address: usize) -> Option<String> {
    None
}

/// Returns `(low, high)` of the calling thread's stack.
#[cfg(target_os = "linux")]
pub(crate) fn thread_stack_bounds() -> Option<(usize, usize)> {
    use std::cell::Cell;

    thread_local! {
        static BOUNDS: Cell<(usize, usize)> = const { Cell::new((0, 0)) };
    }

    let cached = BOUNDS.with(Cell::get);
    if cached.1 != 0 {
        return Some(cached);
    }

    let bounds = unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut addr = std::ptr::null_mut();
        let mut size = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 || addr.is_null() {
            return None;
        }
        (addr as usize, addr as usize + size)
    };

    BOUNDS.with(|cell| cell.set(bounds));
    Some(bounds)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn thread_stack_bounds() -> Option<(usize, usize)> {
    None
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn test_should_restore_errno() {
        errno::set(7);
        let value = preserve_errno(|| {
            errno::set(42);
            1
        });
        assert_eq!(value, 1);
        assert_eq!(errno::get(), 7);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_should_find_stack_bounds_around_local() {
        let local = 0u64;
        let address = &local as *const u64 as usize;
        let (low, high) = thread_stack_bounds().expect("stack bounds");
        assert!(low <= address && address < high);
    }

    #[test]
    #[cfg(unix)]
    fn test_should_name_module_of_function() {
        let address = test_should_name_module_of_function as *const () as usize;
        assert!(module_of(address).is_some());
    }
}
