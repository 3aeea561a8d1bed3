// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! COM provider
//!
//! Implements the provider traits on top of the WMI COM interfaces:
//! - `IWbemLocator` / `IWbemServices` for connections and queries
//! - `IEnumWbemClassObject` / `IWbemClassObject` for results
//! - `IUnsecuredApartment` and an `IWbemObjectSink` bridge for events
//!
//! COM is initialised for the calling thread through `wmi::COMLibrary`.

use std::any::Any;
use std::ffi::c_void;
use std::rc::Rc;
use std::sync::Arc;

use windows::core::{implement, IUnknown, Interface, BSTR, HRESULT, HSTRING, VARIANT};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeSecurity, CoSetProxyBlanket, CLSCTX_INPROC_SERVER,
    CLSCTX_LOCAL_SERVER, EOAC_NONE, RPC_C_AUTHN_LEVEL_CALL, RPC_C_AUTHN_LEVEL_DEFAULT,
    RPC_C_IMP_LEVEL_IMPERSONATE, SAFEARRAY,
};
use windows::Win32::System::Ole::{
    SafeArrayAccessData, SafeArrayDestroy, SafeArrayGetLBound, SafeArrayGetUBound,
    SafeArrayUnaccessData,
};
use windows::Win32::System::Rpc::{RPC_C_AUTHN_WINNT, RPC_C_AUTHZ_NONE};
use windows::Win32::System::Variant::{
    VARENUM, VT_ARRAY, VT_BOOL, VT_BSTR, VT_EMPTY, VT_I2, VT_I4, VT_NULL, VT_R8, VT_UI1,
    VT_UNKNOWN,
};
use windows::Win32::System::Wmi::{
    IEnumWbemClassObject, IUnsecuredApartment, IWbemClassObject, IWbemLocator, IWbemObjectSink,
    IWbemObjectSink_Impl, IWbemServices, UnsecuredApartment, WbemLocator, WBEM_CONDITION_FLAG_TYPE,
    WBEM_FLAG_ALWAYS,
    WBEM_FLAG_NONSYSTEM_ONLY, WBEM_FLAG_RETURN_WBEM_COMPLETE, WBEM_GENERIC_FLAG_TYPE,
    WBEM_INFINITE,
};
use wmi::{COMLibrary, WMIError};

use super::{
    deliver, deliver_status, ClassObject, Connector, EventSink, ForeignObject, ObjectEnumerator, ObjectSink, ObjectStub,
    QueryFlags, Services, SinkStatus, StatusKind, Timeout, UnsecuredApartment as Apartment,
};
use crate::error::{BootstrapFailure, BootstrapStage, HResult};
use crate::variant::{ArrayData, SafeArray, VarType, Variant};

/// `RPC_E_TOO_LATE`: security was already initialised for this process
const RPC_E_TOO_LATE: HRESULT = HRESULT(0x8001_0119_u32 as i32);

fn hresult(err: windows::core::Error) -> HResult {
    HResult(err.code().0)
}

fn wmi_hresult(err: WMIError) -> HResult {
    match err {
        WMIError::HResultError { hres } => HResult(hres),
        other => {
            log::debug!("COM initialisation failed: {}", other);
            HResult::E_FAIL
        }
    }
}

/// Connector for the local WMI service.
///
/// COM is initialised on the thread that connects. `wmi::COMLibrary` never
/// uninitialises it, so handles dropped after the session stay valid.
#[derive(Debug, Default, Clone, Copy)]
pub struct ComConnector;

impl ComConnector {
    pub fn new() -> Self {
        Self
    }

    /// Initialise COM (multithreaded) and process-wide default security
    fn initialize(&self) -> Result<(), BootstrapFailure> {
        let _com = COMLibrary::without_security()
            .map_err(|e| BootstrapFailure::new(BootstrapStage::Initialize, wmi_hresult(e)))?;

        let security = unsafe {
            CoInitializeSecurity(
                None,
                -1,
                None,
                None,
                RPC_C_AUTHN_LEVEL_DEFAULT,
                RPC_C_IMP_LEVEL_IMPERSONATE,
                None,
                EOAC_NONE,
                None,
            )
        };
        match security {
            Ok(()) => {}
            Err(e) if e.code() == RPC_E_TOO_LATE => {
                log::debug!("COM security already initialised for this process");
            }
            Err(e) => return Err(BootstrapFailure::new(BootstrapStage::Security, hresult(e))),
        }
        Ok(())
    }
}

impl Connector for ComConnector {
    fn connect_root(&self, namespace: &str) -> Result<Box<dyn Services>, BootstrapFailure> {
        self.initialize()?;

        let locator: IWbemLocator =
            unsafe { CoCreateInstance(&WbemLocator, None, CLSCTX_INPROC_SERVER) }
                .map_err(|e| BootstrapFailure::new(BootstrapStage::Locator, hresult(e)))?;

        let services = unsafe {
            locator.ConnectServer(
                &BSTR::from(namespace),
                &BSTR::new(),
                &BSTR::new(),
                &BSTR::new(),
                0,
                &BSTR::new(),
                None,
            )
        }
        .map_err(|e| BootstrapFailure::new(BootstrapStage::Connect, hresult(e)))?;

        secure(&services)
            .map_err(|e| BootstrapFailure::new(BootstrapStage::ProxyBlanket, hresult(e)))?;

        Ok(Box::new(WinServices { inner: services }))
    }

    fn create_unsecured_apartment(&self) -> Result<Box<dyn Apartment>, HResult> {
        let apartment: IUnsecuredApartment =
            unsafe { CoCreateInstance(&UnsecuredApartment, None, CLSCTX_LOCAL_SERVER) }
                .map_err(hresult)?;
        Ok(Box::new(WinApartment { inner: apartment }))
    }
}

/// Impersonate the caller on every call through `services`
fn secure(services: &IWbemServices) -> windows::core::Result<()> {
    unsafe {
        CoSetProxyBlanket(
            services,
            RPC_C_AUTHN_WINNT,
            RPC_C_AUTHZ_NONE,
            None,
            RPC_C_AUTHN_LEVEL_CALL,
            RPC_C_IMP_LEVEL_IMPERSONATE,
            None,
            EOAC_NONE,
        )
    }
}

fn flags(flags: QueryFlags) -> WBEM_GENERIC_FLAG_TYPE {
    WBEM_GENERIC_FLAG_TYPE(flags.bits() as i32)
}

struct WinServices {
    inner: IWbemServices,
}

impl Services for WinServices {
    fn open_namespace(&self, namespace: &str) -> Result<Box<dyn Services>, HResult> {
        let mut opened = None;
        unsafe {
            self.inner.OpenNamespace(
                &BSTR::from(namespace),
                WBEM_FLAG_RETURN_WBEM_COMPLETE,
                None,
                Some(&mut opened),
                None,
            )
        }
        .map_err(hresult)?;

        let services = opened.ok_or(HResult::WBEM_E_INVALID_NAMESPACE)?;
        secure(&services).map_err(hresult)?;
        Ok(Box::new(WinServices { inner: services }))
    }

    fn exec_query(
        &self,
        language: &str,
        query: &str,
        query_flags: QueryFlags,
    ) -> Result<Box<dyn ObjectEnumerator>, HResult> {
        let enumerator = unsafe {
            self.inner.ExecQuery(
                &BSTR::from(language),
                &BSTR::from(query),
                flags(query_flags),
                None,
            )
        }
        .map_err(hresult)?;
        Ok(Box::new(WinEnumerator { inner: enumerator }))
    }

    fn exec_notification_query_async(
        &self,
        language: &str,
        query: &str,
        query_flags: QueryFlags,
        sink: &dyn ObjectSink,
    ) -> Result<(), HResult> {
        let sink = sink
            .as_any()
            .downcast_ref::<WinObjectSink>()
            .ok_or(HResult::E_NOINTERFACE)?;
        unsafe {
            self.inner.ExecNotificationQueryAsync(
                &BSTR::from(language),
                &BSTR::from(query),
                flags(query_flags),
                None,
                &sink.inner,
            )
        }
        .map_err(hresult)
    }
}

struct WinEnumerator {
    inner: IEnumWbemClassObject,
}

impl ObjectEnumerator for WinEnumerator {
    fn next_object(&mut self, timeout: Timeout) -> Result<Option<Box<dyn ClassObject>>, HResult> {
        let timeout = match timeout {
            Timeout::Infinite => WBEM_INFINITE,
            Timeout::Millis(ms) => ms.min(i32::MAX as u32) as i32,
        };
        let mut objects: [Option<IWbemClassObject>; 1] = [None];
        let mut returned = 0u32;
        unsafe { self.inner.Next(timeout, &mut objects, &mut returned) }
            .ok()
            .map_err(hresult)?;

        if returned == 0 {
            return Ok(None);
        }
        Ok(objects[0]
            .take()
            .map(|object| Box::new(WinClassObject { inner: object }) as Box<dyn ClassObject>))
    }
}

struct WinClassObject {
    inner: IWbemClassObject,
}

impl ClassObject for WinClassObject {
    fn property_names(&self) -> Result<Vec<String>, HResult> {
        let names = unsafe {
            self.inner.GetNames(
                None,
                WBEM_CONDITION_FLAG_TYPE(WBEM_FLAG_ALWAYS.0 | WBEM_FLAG_NONSYSTEM_ONLY.0),
                std::ptr::null_mut(),
            )
        }
        .map_err(hresult)?;

        let result = unsafe { read_array::<*const u16>(names) }
            .map(|(_, _, raw)| raw.iter().map(bstr_text).collect::<Vec<String>>());
        unsafe { SafeArrayDestroy(names) }.map_err(hresult)?;
        result.map_err(hresult)
    }

    fn get(&self, name: &str) -> Result<Variant, HResult> {
        let mut value = VARIANT::default();
        unsafe {
            self.inner
                .Get(&HSTRING::from(name), 0, &mut value, None, None)
        }
        .map_err(hresult)?;
        // `value` is cleared when dropped.
        Ok(decode(&value))
    }
}

/// An `IUnknown` carried in a property value
struct WinForeign {
    inner: IUnknown,
}

impl ForeignObject for WinForeign {
    fn query_class_object(&self) -> Result<Box<dyn ClassObject>, HResult> {
        let object = self.inner.cast::<IWbemClassObject>().map_err(hresult)?;
        Ok(Box::new(WinClassObject { inner: object }))
    }
}

/// A null interface pointer
struct NullObject;

impl ForeignObject for NullObject {
    fn query_class_object(&self) -> Result<Box<dyn ClassObject>, HResult> {
        Err(HResult::E_NOINTERFACE)
    }
}

fn foreign(ptr: *mut c_void) -> Rc<dyn ForeignObject> {
    match unsafe { IUnknown::from_raw_borrowed(&ptr) } {
        Some(unknown) => Rc::new(WinForeign {
            inner: unknown.clone(),
        }),
        None => Rc::new(NullObject),
    }
}

/// Text of a borrowed BSTR
fn bstr_text(ptr: &*const u16) -> String {
    // BSTR is a transparent pointer; the borrow does not take ownership.
    let bstr: &BSTR = unsafe { &*(ptr as *const *const u16 as *const BSTR) };
    bstr.to_string()
}

/// Convert a property value. The source keeps ownership of every
/// pointer it holds.
fn decode(value: &VARIANT) -> Variant {
    let raw = value.as_raw();
    let tag = unsafe { raw.Anonymous.Anonymous.vt };
    let data = unsafe { &raw.Anonymous.Anonymous.Anonymous };
    let vt = VARENUM(tag);

    if vt.0 & VT_ARRAY.0 != 0 {
        let element = VARENUM(vt.0 & !VT_ARRAY.0);
        let array = unsafe { data.parray } as *const SAFEARRAY;
        return Variant::Array(decode_array(array, element));
    }

    match vt {
        VT_EMPTY => Variant::Empty,
        VT_NULL => Variant::Null,
        VT_BOOL => Variant::Bool(unsafe { data.boolVal }),
        VT_I2 => Variant::I2(unsafe { data.iVal }),
        VT_I4 => Variant::I4(unsafe { data.lVal }),
        VT_R8 => Variant::R8(unsafe { data.dblVal }),
        VT_UI1 => Variant::UI1(unsafe { data.bVal }),
        VT_BSTR => Variant::String(bstr_text(unsafe { &data.bstrVal })),
        VT_UNKNOWN => Variant::Unknown(foreign(unsafe { data.punkVal })),
        other => Variant::Unsupported(VarType(other.0)),
    }
}

fn decode_array(array: *const SAFEARRAY, element: VARENUM) -> SafeArray {
    let tag = VarType(element.0);
    let decoded = unsafe {
        match element {
            VT_I4 => read_array::<i32>(array).map(|(lo, hi, v)| (lo, hi, ArrayData::I4(v))),
            VT_UI1 => read_array::<u8>(array).map(|(lo, hi, v)| (lo, hi, ArrayData::UI1(v))),
            VT_BSTR => read_array::<*const u16>(array).map(|(lo, hi, v)| {
                (lo, hi, ArrayData::String(v.iter().map(bstr_text).collect()))
            }),
            VT_UNKNOWN => read_array::<*mut c_void>(array).map(|(lo, hi, v)| {
                (lo, hi, ArrayData::Unknown(v.into_iter().map(foreign).collect()))
            }),
            _ => bounds(array).map(|(lo, hi)| (lo, hi, ArrayData::Other(tag))),
        }
    };

    match decoded {
        Ok((lower, upper, data)) => SafeArray::new(lower, upper, data),
        Err(code) => {
            log::debug!("Array of {:?} not accessible: error code = {}", tag, code);
            SafeArray::from_data(ArrayData::Inaccessible(tag))
        }
    }
}

unsafe fn bounds(array: *const SAFEARRAY) -> windows::core::Result<(i32, i32)> {
    if array.is_null() {
        return Err(windows::core::Error::from(windows::Win32::Foundation::E_POINTER));
    }
    Ok((SafeArrayGetLBound(array, 1)?, SafeArrayGetUBound(array, 1)?))
}

/// Copy the elements of a one-dimensional array. The array stays owned by
/// its source.
unsafe fn read_array<T: Copy>(
    array: *const SAFEARRAY,
) -> windows::core::Result<(i32, i32, Vec<T>)> {
    let (lower, upper) = bounds(array)?;
    let len = (upper as i64 - lower as i64 + 1).max(0) as usize;

    let mut data: *mut c_void = std::ptr::null_mut();
    SafeArrayAccessData(array, &mut data)?;
    let elements = if len == 0 || data.is_null() {
        Vec::new()
    } else {
        std::slice::from_raw_parts(data as *const T, len).to_vec()
    };
    SafeArrayUnaccessData(array)?;

    Ok((lower, upper, elements))
}

struct WinApartment {
    inner: IUnsecuredApartment,
}

impl Apartment for WinApartment {
    fn create_object_stub(&self, sink: Arc<dyn EventSink>) -> Result<Box<dyn ObjectStub>, HResult> {
        let bridge: IUnknown = SinkBridge { sink }.into();
        let stub = unsafe { self.inner.CreateObjectStub(&bridge) }.map_err(hresult)?;
        Ok(Box::new(WinStub { inner: stub }))
    }
}

struct WinStub {
    inner: IUnknown,
}

impl ObjectStub for WinStub {
    fn query_object_sink(&self) -> Result<Box<dyn ObjectSink>, HResult> {
        let sink = self.inner.cast::<IWbemObjectSink>().map_err(hresult)?;
        Ok(Box::new(WinObjectSink { inner: sink }))
    }
}

struct WinObjectSink {
    inner: IWbemObjectSink,
}

impl ObjectSink for WinObjectSink {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Forwards `IWbemObjectSink` calls to a caller's [`EventSink`]
#[implement(IWbemObjectSink)]
struct SinkBridge {
    sink: Arc<dyn EventSink>,
}

#[allow(non_snake_case)]
impl IWbemObjectSink_Impl for SinkBridge_Impl {
    fn Indicate(
        &self,
        lobjectcount: i32,
        apobjarray: *const Option<IWbemClassObject>,
    ) -> windows::core::Result<()> {
        if lobjectcount <= 0 || apobjarray.is_null() {
            return Ok(());
        }
        let objects = unsafe { std::slice::from_raw_parts(apobjarray, lobjectcount as usize) };
        let objects: Vec<Box<dyn ClassObject>> = objects
            .iter()
            .flatten()
            .map(|object| {
                Box::new(WinClassObject {
                    inner: object.clone(),
                }) as Box<dyn ClassObject>
            })
            .collect();
        deliver(self.sink.as_ref(), objects);
        Ok(())
    }

    fn SetStatus(
        &self,
        lflags: i32,
        hresult: HRESULT,
        strparam: &BSTR,
        _pobjparam: Option<&IWbemClassObject>,
    ) -> windows::core::Result<()> {
        let message = (!strparam.is_empty()).then(|| strparam.to_string());
        deliver_status(
            self.sink.as_ref(),
            SinkStatus {
                kind: StatusKind::from_raw(lflags),
                code: HResult(hresult.0),
                message,
            },
        );
        Ok(())
    }
}

#[cfg(all(test, windows))]
mod tests {
    use super::*;
    use crate::marshal::{reinterpret, Marshaler, UNKNOWN_TYPE};

    #[test]
    fn test_decode_scalars() {
        assert!(matches!(decode(&VARIANT::from(4242i32)), Variant::I4(4242)));
        assert!(matches!(decode(&VARIANT::from(-3i16)), Variant::I2(-3)));
        assert!(matches!(decode(&VARIANT::from(1.5f64)), Variant::R8(v) if v == 1.5));
        assert!(matches!(decode(&VARIANT::from(255u8)), Variant::UI1(255)));
        assert!(matches!(
            decode(&VARIANT::from(BSTR::from("Spooler"))),
            Variant::String(s) if s == "Spooler"
        ));
    }

    #[test]
    fn test_decode_bool_keeps_native_encoding() {
        let value = decode(&VARIANT::from(true));
        assert!(matches!(value, Variant::Bool(-1)));
        assert_eq!(Marshaler::new().value_to_text(&value), "true");
        assert!(matches!(decode(&VARIANT::from(false)), Variant::Bool(0)));
    }

    #[test]
    fn test_decode_empty() {
        assert!(matches!(decode(&VARIANT::default()), Variant::Empty));
    }

    #[test]
    fn test_decode_unsupported_tag() {
        let value = decode(&VARIANT::from(7i64));
        assert!(matches!(value, Variant::Unsupported(VarType(0x14))));
        assert_eq!(
            Marshaler::new().value_to_text(&value),
            "VARIANT type unsupported: 0x14"
        );
    }

    #[test]
    fn test_decode_null_unknown_is_not_a_class_object() {
        let value = unsafe {
            let mut raw: windows_core::imp::VARIANT = std::mem::zeroed();
            raw.Anonymous.Anonymous.vt = VT_UNKNOWN.0;
            VARIANT::from_raw(raw)
        };
        let decoded = decode(&value);
        match &decoded {
            Variant::Unknown(foreign) => assert!(reinterpret(foreign.as_ref()).is_none()),
            other => panic!("expected an unknown value, got {:?}", other),
        }
        assert_eq!(Marshaler::new().value_to_text(&decoded), UNKNOWN_TYPE);
    }

    #[test]
    fn test_decode_null_array_is_inaccessible() {
        let array = decode_array(std::ptr::null(), VT_I4);
        assert!(matches!(array.data(), ArrayData::Inaccessible(VarType(3))));
    }
}
