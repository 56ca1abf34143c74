//! Icon extraction
//!
//! Pulls the first icon out of a PE file's resources and converts it to a
//! base64-encoded PNG: icon handle → color bitmap → 32-bit top-down DIB →
//! alpha repair → BGRA→RGBA → PNG. Every GDI handle acquired along the way
//! is owned by a scope-bounded guard so all exit paths release it.

use std::ffi::c_void;
use std::io::Cursor;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use windows::core::PCWSTR;
use windows::Win32::Graphics::Gdi::{
    CreateCompatibleDC, DeleteDC, DeleteObject, GetDC, GetDIBits, GetObjectW, ReleaseDC, BITMAP,
    BITMAPINFO, BITMAPINFOHEADER, BI_RGB, DIB_RGB_COLORS, HDC, HGDIOBJ,
};
use windows::Win32::UI::Shell::ExtractIconExW;
use windows::Win32::UI::WindowsAndMessaging::{DestroyIcon, GetIconInfo, HICON, ICONINFO};

/// Maximum icon dimension accepted from GetObjectW.
const MAX_ICON_DIM: i32 = 256;

/// Owned icon handle, destroyed on drop.
struct IconGuard(HICON);

impl Drop for IconGuard {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                let _ = DestroyIcon(self.0);
            }
        }
    }
}

/// Owned GDI bitmap handle, deleted on drop.
struct BitmapGuard(HGDIOBJ);

impl Drop for BitmapGuard {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                let _ = DeleteObject(self.0);
            }
        }
    }
}

/// Screen DC, released on drop.
struct ScreenDcGuard(HDC);

impl Drop for ScreenDcGuard {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                ReleaseDC(None, self.0);
            }
        }
    }
}

/// Memory DC, deleted on drop.
struct MemDcGuard(HDC);

impl Drop for MemDcGuard {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                let _ = DeleteDC(self.0);
            }
        }
    }
}

/// Extract the first icon from an exe file as a base64-encoded PNG.
///
/// Returns an empty string on any failure; callers treat a missing icon as
/// cosmetic, never as an error for the entry.
pub fn extract_icon_base64(exe_path: &Path) -> String {
    if !exe_path.is_file() {
        return String::new();
    }

    let wide: Vec<u16> = exe_path
        .as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();

    let mut large = HICON::default();
    let mut small = HICON::default();
    let extracted = unsafe {
        ExtractIconExW(
            PCWSTR(wide.as_ptr()),
            0,
            Some(&mut large),
            Some(&mut small),
            1,
        )
    };
    let _large_guard = IconGuard(large);
    let _small_guard = IconGuard(small);

    if extracted == 0 {
        return String::new();
    }

    let icon = if !large.is_invalid() { large } else { small };
    if icon.is_invalid() {
        return String::new();
    }

    match icon_to_png(icon) {
        Some(png) => BASE64.encode(png),
        None => String::new(),
    }
}

/// Render an icon's color bitmap into PNG bytes.
fn icon_to_png(icon: HICON) -> Option<Vec<u8>> {
    let mut info = ICONINFO::default();
    unsafe { GetIconInfo(icon, &mut info).ok()? };
    let _mask_guard = BitmapGuard(HGDIOBJ(info.hbmMask.0));
    let _color_guard = BitmapGuard(HGDIOBJ(info.hbmColor.0));

    if info.hbmColor.is_invalid() {
        return None;
    }

    let mut bitmap = BITMAP::default();
    let copied = unsafe {
        GetObjectW(
            HGDIOBJ(info.hbmColor.0),
            std::mem::size_of::<BITMAP>() as i32,
            Some(&mut bitmap as *mut _ as *mut c_void),
        )
    };
    if copied == 0 {
        return None;
    }

    let width = bitmap.bmWidth;
    let height = bitmap.bmHeight;
    if width <= 0 || height <= 0 || width > MAX_ICON_DIM || height > MAX_ICON_DIM {
        return None;
    }

    let screen_dc = unsafe { GetDC(None) };
    if screen_dc.is_invalid() {
        return None;
    }
    let _screen_guard = ScreenDcGuard(screen_dc);

    let mem_dc = unsafe { CreateCompatibleDC(Some(screen_dc)) };
    if mem_dc.is_invalid() {
        return None;
    }
    let _mem_guard = MemDcGuard(mem_dc);

    let mut header = BITMAPINFO {
        bmiHeader: BITMAPINFOHEADER {
            biSize: std::mem::size_of::<BITMAPINFOHEADER>() as u32,
            biWidth: width,
            biHeight: -height, // top-down
            biPlanes: 1,
            biBitCount: 32,
            biCompression: BI_RGB.0,
            ..Default::default()
        },
        ..Default::default()
    };

    let mut pixels = vec![0u8; (width as usize) * (height as usize) * 4];
    let lines = unsafe {
        GetDIBits(
            mem_dc,
            info.hbmColor,
            0,
            height as u32,
            Some(pixels.as_mut_ptr() as *mut c_void),
            &mut header,
            DIB_RGB_COLORS,
        )
    };
    if lines == 0 {
        return None;
    }

    // Some legacy icons carry an all-zero alpha channel; treat those as
    // fully opaque.
    let has_alpha = pixels.iter().skip(3).step_by(4).any(|&a| a != 0);

    // BGRA → RGBA in place.
    for px in pixels.chunks_exact_mut(4) {
        px.swap(0, 2);
        if !has_alpha {
            px[3] = 255;
        }
    }

    let img = image::RgbaImage::from_raw(width as u32, height as u32, pixels)?;
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png).ok()?;
    Some(buf.into_inner())
}
