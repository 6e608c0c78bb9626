//! Apple Silicon accelerometer source via IOKit HID.
//!
//! Reads the Bosch BMI286 IMU behind the AppleSPU HID interface. Needs root.
//! The HID callback runs on a CFRunLoop owned by a dedicated thread; decoded
//! readings are handed to the sampler over a channel.

use std::ffi::CStr;
use std::os::raw::c_void;
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use tracing::{debug, info};

use crate::error::SensorError;
use crate::sensor::{MotionSource, Reading};

// ── Core Foundation / IOKit types ───────────────────────────────────────────

type CFAllocatorRef = *const c_void;
type CFStringRef = *const c_void;
type CFNumberRef = *const c_void;
type CFTypeRef = *const c_void;
type CFDictionaryRef = *const c_void;
type CFMutableDictionaryRef = *mut c_void;
type CFRunLoopRef = *mut c_void;
type CFIndex = isize;

type IOReturn = i32;
type MachPort = u32;
type IOIterator = u32;
type IOObject = u32;
type IOHIDDeviceRef = *mut c_void;

// ── Constants ───────────────────────────────────────────────────────────────

const KERN_SUCCESS: IOReturn = 0;
const K_IO_RETURN_NOT_PERMITTED: IOReturn = 0xe00002e2_u32 as i32;
const K_IO_MAIN_PORT_DEFAULT: MachPort = 0;
const K_CF_ALLOCATOR_DEFAULT: CFAllocatorRef = std::ptr::null();
const K_CF_STRING_ENCODING_UTF8: u32 = 0x08000100;
const K_CF_NUMBER_SINT32_TYPE: CFIndex = 3;

const PAGE_VENDOR: i32 = 0xFF00;
const USAGE_ACCEL: i32 = 3;

// BMI286 report layout: three little-endian Q16 values starting at byte 6
const IMU_REPORT_LEN: usize = 22;
const IMU_DATA_OFF: usize = 6;
const ACCEL_SCALE: f64 = 65536.0;
/// Standard gravity; the IMU reports in g.
const STANDARD_GRAVITY: f64 = 9.80665;
const IMU_DECIMATION: u32 = 8; // ~800Hz -> ~100Hz
const REPORT_BUF_SZ: usize = 4096;
const REPORT_INTERVAL_US: i32 = 1000;

// ── FFI bindings ────────────────────────────────────────────────────────────

#[link(name = "IOKit", kind = "framework")]
extern "C" {
    fn IOServiceMatching(name: *const i8) -> CFMutableDictionaryRef;
    fn IOServiceGetMatchingServices(
        mainPort: MachPort,
        matching: CFDictionaryRef,
        existing: *mut IOIterator,
    ) -> IOReturn;
    fn IOIteratorNext(iterator: IOIterator) -> IOObject;
    fn IORegistryEntryCreateCFProperty(
        entry: IOObject,
        key: CFStringRef,
        allocator: CFAllocatorRef,
        options: u32,
    ) -> CFTypeRef;
    fn IORegistryEntrySetCFProperty(entry: IOObject, name: CFStringRef, property: CFTypeRef)
        -> IOReturn;
    fn IOObjectRelease(object: IOObject) -> IOReturn;
    fn IOHIDDeviceCreate(allocator: CFAllocatorRef, service: IOObject) -> IOHIDDeviceRef;
    fn IOHIDDeviceOpen(device: IOHIDDeviceRef, options: u32) -> IOReturn;
    fn IOHIDDeviceRegisterInputReportCallback(
        device: IOHIDDeviceRef,
        report: *mut u8,
        reportLength: CFIndex,
        callback: unsafe extern "C" fn(
            context: *mut c_void,
            result: IOReturn,
            sender: *mut c_void,
            report_type: u32,
            report_id: u32,
            report: *mut u8,
            report_length: CFIndex,
        ),
        context: *mut c_void,
    );
    fn IOHIDDeviceScheduleWithRunLoop(
        device: IOHIDDeviceRef,
        runLoop: CFRunLoopRef,
        runLoopMode: CFStringRef,
    );
}

#[link(name = "CoreFoundation", kind = "framework")]
extern "C" {
    fn CFStringCreateWithCString(alloc: CFAllocatorRef, cStr: *const i8, encoding: u32)
        -> CFStringRef;
    fn CFNumberCreate(allocator: CFAllocatorRef, theType: CFIndex, valuePtr: *const c_void)
        -> CFNumberRef;
    fn CFNumberGetValue(number: CFNumberRef, theType: CFIndex, valuePtr: *mut c_void) -> bool;
    fn CFRunLoopGetCurrent() -> CFRunLoopRef;
    fn CFRunLoopRunInMode(mode: CFStringRef, seconds: f64, returnAfterSourceHandled: bool) -> i32;
    fn CFRelease(cf: CFTypeRef);

    static kCFRunLoopDefaultMode: CFStringRef;
}

extern "C" {
    fn geteuid() -> u32;
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn cfstr(s: &CStr) -> CFStringRef {
    unsafe { CFStringCreateWithCString(K_CF_ALLOCATOR_DEFAULT, s.as_ptr(), K_CF_STRING_ENCODING_UTF8) }
}

fn cfnum32(val: i32) -> CFNumberRef {
    unsafe {
        CFNumberCreate(
            K_CF_ALLOCATOR_DEFAULT,
            K_CF_NUMBER_SINT32_TYPE,
            &val as *const i32 as *const c_void,
        )
    }
}

fn prop_int(service: IOObject, key: &CStr) -> Option<i32> {
    let cf_key = cfstr(key);
    let cf_val = unsafe { IORegistryEntryCreateCFProperty(service, cf_key, K_CF_ALLOCATOR_DEFAULT, 0) };
    unsafe { CFRelease(cf_key) };
    if cf_val.is_null() {
        return None;
    }

    let mut val: i32 = 0;
    let ok = unsafe {
        CFNumberGetValue(cf_val, K_CF_NUMBER_SINT32_TYPE, &mut val as *mut i32 as *mut c_void)
    };
    unsafe { CFRelease(cf_val) };
    ok.then_some(val)
}

/// Collect every service matching an IOKit class name.
fn matching_services(class: &CStr) -> Result<Vec<IOObject>, SensorError> {
    let matching = unsafe { IOServiceMatching(class.as_ptr()) };
    if matching.is_null() {
        return Err(SensorError::Unavailable(format!(
            "failed to create matching dict for {}",
            class.to_string_lossy()
        )));
    }

    let mut iterator: IOIterator = 0;
    let kr = unsafe {
        IOServiceGetMatchingServices(K_IO_MAIN_PORT_DEFAULT, matching as CFDictionaryRef, &mut iterator)
    };
    if kr != KERN_SUCCESS {
        return Err(SensorError::Unavailable(format!(
            "IOServiceGetMatchingServices({}) failed: {kr}",
            class.to_string_lossy()
        )));
    }

    let mut services = Vec::new();
    loop {
        let svc = unsafe { IOIteratorNext(iterator) };
        if svc == 0 {
            break;
        }
        services.push(svc);
    }
    unsafe { IOObjectRelease(iterator) };
    Ok(services)
}

/// Wake the SPU drivers so they start producing HID reports.
fn wake_spu_drivers() -> Result<(), SensorError> {
    let props: [(&CStr, i32); 3] = [
        (c"SensorPropertyReportingState", 1),
        (c"SensorPropertyPowerState", 1),
        (c"ReportInterval", REPORT_INTERVAL_US),
    ];

    for svc in matching_services(c"AppleSPUHIDDriver")? {
        for (key, val) in &props {
            let cf_key = cfstr(key);
            let cf_val = cfnum32(*val);
            unsafe {
                IORegistryEntrySetCFProperty(svc, cf_key, cf_val as CFTypeRef);
                CFRelease(cf_key);
                CFRelease(cf_val as CFTypeRef);
            }
        }
        unsafe { IOObjectRelease(svc) };
    }
    Ok(())
}

fn find_accel_device() -> Result<IOObject, SensorError> {
    let mut found = None;
    for svc in matching_services(c"AppleSPUHIDDevice")? {
        let is_accel = found.is_none()
            && prop_int(svc, c"PrimaryUsagePage") == Some(PAGE_VENDOR)
            && prop_int(svc, c"PrimaryUsage") == Some(USAGE_ACCEL);
        if is_accel {
            found = Some(svc);
        } else {
            unsafe { IOObjectRelease(svc) };
        }
    }
    found.ok_or_else(|| {
        SensorError::Unavailable("accelerometer not found (requires an Apple Silicon MacBook)".into())
    })
}

// ── HID report callback ─────────────────────────────────────────────────────

struct CallbackContext {
    tx: mpsc::Sender<Reading>,
    decimation_counter: u32,
    closed: bool,
}

unsafe extern "C" fn accel_report_callback(
    context: *mut c_void,
    _result: IOReturn,
    _sender: *mut c_void,
    _report_type: u32,
    _report_id: u32,
    report: *mut u8,
    report_length: CFIndex,
) {
    if report_length as usize != IMU_REPORT_LEN {
        return;
    }
    let ctx = &mut *(context as *mut CallbackContext);

    ctx.decimation_counter += 1;
    if ctx.decimation_counter < IMU_DECIMATION {
        return;
    }
    ctx.decimation_counter = 0;

    let data = std::slice::from_raw_parts(report, IMU_REPORT_LEN);
    let axis = |i: usize| {
        let o = IMU_DATA_OFF + i * 4;
        let raw = i32::from_le_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]]);
        Some(raw as f64 / ACCEL_SCALE * STANDARD_GRAVITY)
    };

    let reading = Reading {
        x: axis(0),
        y: axis(1),
        z: axis(2),
        at: Instant::now(),
    };

    // Receiver gone means the sampler let go of this source
    if ctx.tx.send(reading).is_err() {
        ctx.closed = true;
    }
}

// ── Run loop thread ─────────────────────────────────────────────────────────

fn run_device(tx: mpsc::Sender<Reading>, ready: mpsc::Sender<Result<(), SensorError>>) {
    let setup = || -> Result<IOHIDDeviceRef, SensorError> {
        wake_spu_drivers()?;
        let service = find_accel_device()?;
        let device = unsafe { IOHIDDeviceCreate(K_CF_ALLOCATOR_DEFAULT, service) };
        unsafe { IOObjectRelease(service) };
        if device.is_null() {
            return Err(SensorError::Unavailable("failed to create IOHIDDevice".into()));
        }
        match unsafe { IOHIDDeviceOpen(device, 0) } {
            KERN_SUCCESS => Ok(device),
            K_IO_RETURN_NOT_PERMITTED => Err(SensorError::PermissionRequired(
                "IOHIDDeviceOpen not permitted, run with sudo".into(),
            )),
            kr => Err(SensorError::Unavailable(format!("failed to open IOHIDDevice (code {kr})"))),
        }
    };

    let device = match setup() {
        Ok(device) => device,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    // Leaked on purpose: the device keeps both pointers registered after this
    // thread returns.
    let report_buf = Box::into_raw(Box::new([0u8; REPORT_BUF_SZ]));
    let ctx = Box::into_raw(Box::new(CallbackContext {
        tx,
        decimation_counter: 0,
        closed: false,
    }));

    unsafe {
        IOHIDDeviceRegisterInputReportCallback(
            device,
            report_buf as *mut u8,
            REPORT_BUF_SZ as CFIndex,
            accel_report_callback,
            ctx as *mut c_void,
        );
        IOHIDDeviceScheduleWithRunLoop(device, CFRunLoopGetCurrent(), kCFRunLoopDefaultMode);
    }

    info!("accelerometer active");
    let _ = ready.send(Ok(()));

    while !unsafe { (*ctx).closed } {
        unsafe {
            CFRunLoopRunInMode(kCFRunLoopDefaultMode, 1.0, false);
        }
    }
    debug!("accelerometer run loop finished");
}

// ── Source ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct HidAccelerometer {
    rx: Option<mpsc::Receiver<Reading>>,
}

impl HidAccelerometer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MotionSource for HidAccelerometer {
    fn name(&self) -> &'static str {
        "hid"
    }

    fn open(&mut self) -> Result<(), SensorError> {
        if unsafe { geteuid() } != 0 {
            return Err(SensorError::PermissionRequired(
                "accelerometer access requires root, run with sudo".into(),
            ));
        }

        let (tx, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        thread::Builder::new()
            .name("hid-runloop".into())
            .spawn(move || run_device(tx, ready_tx))
            .map_err(|e| SensorError::Unavailable(format!("failed to spawn HID thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.rx = Some(rx);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SensorError::Unavailable("HID thread exited during setup".into())),
        }
    }

    fn next_reading(&mut self) -> Option<Reading> {
        self.rx.as_ref()?.recv().ok()
    }
}
