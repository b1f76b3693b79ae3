//! OS-level SOCKS proxy switch.
//!
//! Both operations are idempotent and take effect for new connections.
//! Callers serialize enable/disable themselves.

use std::sync::Arc;

use crate::error::ToggleError;

/// Addresses that never go through the proxy.
pub const BYPASS_HOSTS: [&str; 3] = ["localhost", "127.0.0.1", "<local>"];

pub trait SystemProxy: Send + Sync {
    fn enable(&self, host: &str, port: u16) -> Result<(), ToggleError>;
    fn disable(&self) -> Result<(), ToggleError>;
}

/// The toggle for the current platform.
pub fn platform_proxy() -> Arc<dyn SystemProxy> {
    #[cfg(target_os = "windows")]
    {
        Arc::new(WinInetProxy)
    }
    #[cfg(target_os = "linux")]
    {
        Arc::new(GsettingsProxy)
    }
    #[cfg(not(any(target_os = "windows", target_os = "linux")))]
    {
        Arc::new(NoopProxy)
    }
}

/// Leaves OS settings alone; applications point at the SOCKS port themselves.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProxy;

impl SystemProxy for NoopProxy {
    fn enable(&self, host: &str, port: u16) -> Result<(), ToggleError> {
        tracing::info!(host, port, "system proxy not managed on this platform");
        Ok(())
    }

    fn disable(&self) -> Result<(), ToggleError> {
        Ok(())
    }
}

#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct GsettingsProxy;

#[cfg(target_os = "linux")]
impl GsettingsProxy {
    fn set(schema: &str, key: &str, value: &str) -> Result<(), ToggleError> {
        let output = std::process::Command::new("gsettings")
            .args(["set", schema, key, value])
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ToggleError::Command(format!(
                "gsettings set {schema} {key}: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
impl SystemProxy for GsettingsProxy {
    fn enable(&self, host: &str, port: u16) -> Result<(), ToggleError> {
        Self::set("org.gnome.system.proxy.socks", "host", &format!("'{host}'"))?;
        Self::set("org.gnome.system.proxy.socks", "port", &port.to_string())?;
        Self::set(
            "org.gnome.system.proxy",
            "ignore-hosts",
            "['localhost', '127.0.0.0/8', '::1']",
        )?;
        Self::set("org.gnome.system.proxy", "mode", "'manual'")?;
        tracing::info!(host, port, "system proxy enabled");
        Ok(())
    }

    fn disable(&self) -> Result<(), ToggleError> {
        Self::set("org.gnome.system.proxy", "mode", "'none'")?;
        tracing::info!("system proxy disabled");
        Ok(())
    }
}

#[cfg(target_os = "windows")]
pub use wininet::WinInetProxy;

#[cfg(target_os = "windows")]
mod wininet {
    use std::ffi::c_void;

    use windows_sys::Win32::Foundation::ERROR_SUCCESS;
    use windows_sys::Win32::Networking::WinInet::{
        InternetSetOptionW, INTERNET_OPTION_REFRESH, INTERNET_OPTION_SETTINGS_CHANGED,
    };
    use windows_sys::Win32::System::Registry::{
        RegCloseKey, RegCreateKeyExW, RegSetValueExW, HKEY, HKEY_CURRENT_USER, KEY_SET_VALUE,
        REG_DWORD, REG_OPTION_NON_VOLATILE, REG_SZ,
    };

    use super::{SystemProxy, BYPASS_HOSTS};
    use crate::error::ToggleError;

    const INTERNET_SETTINGS_KEY: &str =
        r"Software\Microsoft\Windows\CurrentVersion\Internet Settings";

    fn wide(value: &str) -> Vec<u16> {
        value.encode_utf16().chain(std::iter::once(0)).collect()
    }

    struct Key(HKEY);

    impl Drop for Key {
        fn drop(&mut self) {
            unsafe {
                RegCloseKey(self.0);
            }
        }
    }

    impl Key {
        fn internet_settings() -> Result<Self, ToggleError> {
            let subkey = wide(INTERNET_SETTINGS_KEY);
            let mut handle: HKEY = 0;
            let code = unsafe {
                RegCreateKeyExW(
                    HKEY_CURRENT_USER,
                    subkey.as_ptr(),
                    0,
                    std::ptr::null(),
                    REG_OPTION_NON_VOLATILE,
                    KEY_SET_VALUE,
                    std::ptr::null(),
                    &mut handle,
                    std::ptr::null_mut(),
                )
            };
            if code != ERROR_SUCCESS {
                return Err(ToggleError::Registry {
                    call: "RegCreateKeyExW",
                    code,
                });
            }
            Ok(Self(handle))
        }

        fn set_dword(&self, name: &str, value: u32) -> Result<(), ToggleError> {
            let name = wide(name);
            let bytes = value.to_le_bytes();
            let code = unsafe {
                RegSetValueExW(
                    self.0,
                    name.as_ptr(),
                    0,
                    REG_DWORD,
                    bytes.as_ptr(),
                    bytes.len() as u32,
                )
            };
            check(code)
        }

        fn set_string(&self, name: &str, value: &str) -> Result<(), ToggleError> {
            let name = wide(name);
            let data = wide(value);
            let code = unsafe {
                RegSetValueExW(
                    self.0,
                    name.as_ptr(),
                    0,
                    REG_SZ,
                    data.as_ptr() as *const u8,
                    (data.len() * std::mem::size_of::<u16>()) as u32,
                )
            };
            check(code)
        }
    }

    fn check(code: u32) -> Result<(), ToggleError> {
        if code == ERROR_SUCCESS {
            Ok(())
        } else {
            Err(ToggleError::Registry {
                call: "RegSetValueExW",
                code,
            })
        }
    }

    fn notify_settings_changed() {
        unsafe {
            InternetSetOptionW(
                std::ptr::null::<c_void>(),
                INTERNET_OPTION_SETTINGS_CHANGED,
                std::ptr::null::<c_void>(),
                0,
            );
            InternetSetOptionW(
                std::ptr::null::<c_void>(),
                INTERNET_OPTION_REFRESH,
                std::ptr::null::<c_void>(),
                0,
            );
        }
    }

    /// Per-user WinINet proxy settings.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct WinInetProxy;

    impl SystemProxy for WinInetProxy {
        fn enable(&self, host: &str, port: u16) -> Result<(), ToggleError> {
            {
                let key = Key::internet_settings()?;
                key.set_dword("ProxyEnable", 1)?;
                key.set_string("ProxyServer", &format!("socks={host}:{port}"))?;
                key.set_string("ProxyOverride", &BYPASS_HOSTS.join(";"))?;
            }
            notify_settings_changed();
            tracing::info!(host, port, "system proxy enabled");
            Ok(())
        }

        fn disable(&self) -> Result<(), ToggleError> {
            {
                let key = Key::internet_settings()?;
                key.set_dword("ProxyEnable", 0)?;
            }
            notify_settings_changed();
            tracing::info!("system proxy disabled");
            Ok(())
        }
    }
}
