//! The synthetic browser global scope.
//!
//! [`install`] populates a fresh engine context with everything the
//! fingerprinting script probes for: `window`, `document`, `navigator`,
//! `screen`, `location`, storage, base64 codecs, timers, the console, the
//! request constructor and the service configuration record. Values are
//! plausible stubs; the goal is that every property the script reads exists
//! with the right shape.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use boa_engine::object::builtins::{JsArray, JsFunction};
use boa_engine::object::{FunctionObjectBuilder, ObjectInitializer};
use boa_engine::property::Attribute;
use boa_engine::{
    Context, JsArgs, JsNativeError, JsObject, JsResult, JsString, JsValue, NativeFunction, Source,
};

use crate::config::ServiceConfig;
use crate::element::{self, Element};
use crate::network::NetworkShim;
use crate::profile::{DeviceClass, EnvironmentProfile, RefererLocation};
use crate::store::{BrowserState, KeyValueStore};
use crate::timers::TimerQueue;

const PRELUDE: &str = include_str!("prelude.js");

/// Longest timer delay honoured; larger values are clamped.
const MAX_TIMER_DELAY_MS: f64 = 2_147_483_647.0;

/// Forgiving decoder used by `atob`.
const FORGIVING: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Everything the global graph is built from.
#[derive(Debug, Clone)]
pub struct HostEnvironment {
    /// Derived device profile.
    pub profile: EnvironmentProfile,
    /// Page location.
    pub location: RefererLocation,
    /// `_smConf` contents.
    pub service: ServiceConfig,
    /// Storage and cookie jar for this run.
    pub state: BrowserState,
    /// Owner of the script's requests.
    pub network: Rc<RefCell<NetworkShim>>,
    /// Pending timers.
    pub timers: Rc<RefCell<TimerQueue>>,
}

/// Script-side entry points for asynchronous events.
#[derive(Debug)]
pub struct Dispatchers {
    complete_request: JsObject,
    fire_timer: JsObject,
}

impl Dispatchers {
    /// Deliver a finished request to its handlers.
    ///
    /// # Errors
    ///
    /// Propagates any exception thrown by the script's handlers.
    pub fn complete_request(&self, id: u32, result: JsValue, ctx: &mut Context) -> JsResult<()> {
        self.complete_request
            .call(&JsValue::undefined(), &[id.into(), result], ctx)?;
        Ok(())
    }

    /// Run the callback of a due timer.
    ///
    /// # Errors
    ///
    /// Propagates any exception thrown by the callback.
    pub fn fire_timer(&self, id: u32, ctx: &mut Context) -> JsResult<()> {
        self.fire_timer
            .call(&JsValue::undefined(), &[id.into()], ctx)?;
        Ok(())
    }
}

/// Build a native function from a closure over host-side state.
#[allow(unsafe_code)]
pub(crate) fn host_fn<F>(f: F) -> NativeFunction
where
    F: Fn(&JsValue, &[JsValue], &mut Context) -> JsResult<JsValue> + 'static,
{
    // SAFETY: callers capture only reference-counted Rust state and plain
    // values, never garbage-collected engine objects, so there is nothing
    // for the collector to trace inside the closure.
    unsafe { NativeFunction::from_closure(f) }
}

/// Populate `context`'s global object.
///
/// # Errors
///
/// Returns an error if a global cannot be defined or the prelude fails.
pub fn install(context: &mut Context, env: &HostEnvironment) -> JsResult<Dispatchers> {
    let global = context.global_object();
    for alias in ["window", "self", "top", "parent", "frames"] {
        register(context, alias, global.clone())?;
    }

    let location = location_object(context, &env.location);
    register(context, "location", location.clone())?;
    let document = document_object(context, &env.location, &env.state, location);
    register(context, "document", document)?;
    let navigator = navigator_object(context, &env.profile);
    register(context, "navigator", navigator)?;
    let screen = screen_object(context, &env.profile);
    register(context, "screen", screen)?;

    let storage = storage_object(context, env.state.storage());
    register(context, "localStorage", storage.clone())?;
    register(context, "sessionStorage", storage)?;

    install_window_properties(context, &env.profile, &env.location)?;
    install_functions(context)?;

    let service = serde_json::to_value(&env.service)
        .map_err(|e| JsNativeError::typ().with_message(e.to_string()))?;
    let service = JsValue::from_json(&service, context)?;
    register(context, "_smConf", service)?;
    let ready_funcs = JsArray::new(context);
    register(context, "_smReadyFuncs", ready_funcs)?;

    install_prelude(context, env)
}

fn register(context: &mut Context, name: &str, value: impl Into<JsValue>) -> JsResult<()> {
    context.register_global_property(JsString::from(name), value, Attribute::all())
}

fn getter(context: &mut Context, name: &str, function: NativeFunction) -> JsFunction {
    FunctionObjectBuilder::new(context.realm(), function)
        .name(JsString::from(name))
        .length(0)
        .constructor(false)
        .build()
}

fn setter(context: &mut Context, name: &str, function: NativeFunction) -> JsFunction {
    FunctionObjectBuilder::new(context.realm(), function)
        .name(JsString::from(name))
        .length(1)
        .constructor(false)
        .build()
}

fn string(value: &str) -> JsString {
    JsString::from(value)
}

fn location_object(context: &mut Context, location: &RefererLocation) -> JsObject {
    let to_string = {
        let href = location.href.clone();
        host_fn(move |_this, _args, _ctx| Ok(string(&href).into()))
    };

    let mut init = ObjectInitializer::new(context);
    for (name, value) in [
        ("href", &location.href),
        ("protocol", &location.protocol),
        ("host", &location.host),
        ("hostname", &location.hostname),
        ("port", &location.port),
        ("pathname", &location.pathname),
        ("search", &location.search),
        ("hash", &location.hash),
        ("origin", &location.origin),
    ] {
        init.property(string(name), string(value), Attribute::all());
    }
    init.function(to_string, string("toString"), 0)
        .function(NativeFunction::from_fn_ptr(element::noop), string("assign"), 1)
        .function(NativeFunction::from_fn_ptr(element::noop), string("replace"), 1)
        .function(NativeFunction::from_fn_ptr(element::noop), string("reload"), 0);
    init.build()
}

fn document_object(
    context: &mut Context,
    location: &RefererLocation,
    state: &BrowserState,
    location_obj: JsObject,
) -> JsObject {
    let cookie_get = {
        let state = state.clone();
        getter(
            context,
            "cookie",
            host_fn(move |_this, _args, _ctx| Ok(string(&state.cookie_header()).into())),
        )
    };
    let cookie_set = {
        let state = state.clone();
        setter(
            context,
            "cookie",
            host_fn(move |_this, args, ctx| {
                let assignment = args.get_or_undefined(0).to_string(ctx)?;
                state.assign_cookie(&assignment.to_std_string_escaped());
                Ok(JsValue::undefined())
            }),
        )
    };
    let body = Element::create("body").into_object(context);
    let head = Element::create("head").into_object(context);
    let html = Element::create("html").into_object(context);

    let mut init = ObjectInitializer::new(context);
    init.property(string("location"), location_obj, Attribute::all())
        .property(string("URL"), string(&location.href), Attribute::all())
        .property(string("documentURI"), string(&location.href), Attribute::all())
        .property(string("domain"), string(&location.hostname), Attribute::all())
        .property(string("referrer"), string(""), Attribute::all())
        .property(string("title"), string(""), Attribute::all())
        .property(string("readyState"), string("complete"), Attribute::all())
        .property(string("characterSet"), string("UTF-8"), Attribute::all())
        .property(string("charset"), string("UTF-8"), Attribute::all())
        .property(string("compatMode"), string("CSS1Compat"), Attribute::all())
        .property(string("visibilityState"), string("visible"), Attribute::all())
        .property(string("hidden"), false, Attribute::all())
        .property(string("body"), body, Attribute::all())
        .property(string("head"), head, Attribute::all())
        .property(string("documentElement"), html, Attribute::all())
        .accessor(
            string("cookie"),
            Some(cookie_get),
            Some(cookie_set),
            Attribute::CONFIGURABLE | Attribute::ENUMERABLE,
        )
        .function(NativeFunction::from_fn_ptr(create_element), string("createElement"), 1)
        .function(NativeFunction::from_fn_ptr(element::null_fn), string("getElementById"), 1)
        .function(NativeFunction::from_fn_ptr(element::null_fn), string("querySelector"), 1)
        .function(NativeFunction::from_fn_ptr(empty_list), string("querySelectorAll"), 1)
        .function(NativeFunction::from_fn_ptr(empty_list), string("getElementsByTagName"), 1)
        .function(NativeFunction::from_fn_ptr(empty_list), string("getElementsByClassName"), 1)
        .function(NativeFunction::from_fn_ptr(true_fn), string("hasFocus"), 0);
    for name in ["addEventListener", "removeEventListener", "dispatchEvent"] {
        init.function(NativeFunction::from_fn_ptr(element::noop), string(name), 2);
    }
    init.build()
}

fn navigator_object(context: &mut Context, profile: &EnvironmentProfile) -> JsObject {
    let languages = JsArray::from_iter(
        profile.languages.iter().map(|l| string(l).into()),
        context,
    );
    let plugins = empty_collection(context);
    let mime_types = empty_collection(context);
    let app_version = profile
        .user_agent
        .strip_prefix("Mozilla/")
        .unwrap_or(&profile.user_agent);
    let vendor = if profile.user_agent.contains("Chrome") {
        "Google Inc."
    } else if profile.user_agent.contains("Safari") {
        "Apple Computer, Inc."
    } else {
        ""
    };
    let class = profile.device_class;

    ObjectInitializer::new(context)
        .property(string("userAgent"), string(&profile.user_agent), Attribute::all())
        .property(string("appVersion"), string(app_version), Attribute::all())
        .property(string("appName"), string("Netscape"), Attribute::all())
        .property(string("appCodeName"), string("Mozilla"), Attribute::all())
        .property(string("product"), string("Gecko"), Attribute::all())
        .property(string("vendor"), string(vendor), Attribute::all())
        .property(string("platform"), string(&profile.platform), Attribute::all())
        .property(string("language"), string(profile.language()), Attribute::all())
        .property(string("languages"), languages, Attribute::all())
        .property(string("hardwareConcurrency"), class.hardware_concurrency(), Attribute::all())
        .property(string("maxTouchPoints"), class.max_touch_points(), Attribute::all())
        .property(string("cookieEnabled"), true, Attribute::all())
        .property(string("onLine"), true, Attribute::all())
        .property(string("webdriver"), false, Attribute::all())
        .property(string("doNotTrack"), JsValue::null(), Attribute::all())
        .property(string("plugins"), plugins, Attribute::all())
        .property(string("mimeTypes"), mime_types, Attribute::all())
        .function(NativeFunction::from_fn_ptr(false_fn), string("javaEnabled"), 0)
        .build()
}

fn empty_collection(context: &mut Context) -> JsObject {
    ObjectInitializer::new(context)
        .property(string("length"), 0, Attribute::all())
        .function(NativeFunction::from_fn_ptr(element::null_fn), string("item"), 1)
        .function(NativeFunction::from_fn_ptr(element::null_fn), string("namedItem"), 1)
        .function(NativeFunction::from_fn_ptr(element::noop), string("refresh"), 0)
        .build()
}

fn screen_object(context: &mut Context, profile: &EnvironmentProfile) -> JsObject {
    let geometry = profile.geometry;
    let orientation = match profile.device_class {
        DeviceClass::Mobile => "portrait-primary",
        DeviceClass::Desktop => "landscape-primary",
    };
    let orientation = ObjectInitializer::new(context)
        .property(string("type"), string(orientation), Attribute::all())
        .property(string("angle"), 0, Attribute::all())
        .build();

    ObjectInitializer::new(context)
        .property(string("width"), geometry.screen_width, Attribute::all())
        .property(string("height"), geometry.screen_height, Attribute::all())
        .property(string("availWidth"), geometry.avail_width, Attribute::all())
        .property(string("availHeight"), geometry.avail_height, Attribute::all())
        .property(string("availLeft"), 0, Attribute::all())
        .property(string("availTop"), 0, Attribute::all())
        .property(string("colorDepth"), 24, Attribute::all())
        .property(string("pixelDepth"), 24, Attribute::all())
        .property(string("orientation"), orientation, Attribute::all())
        .build()
}

fn storage_object(context: &mut Context, store: &Rc<RefCell<KeyValueStore>>) -> JsObject {
    let get_item = {
        let store = store.clone();
        host_fn(move |_this, args, ctx| {
            let key = args.get_or_undefined(0).to_string(ctx)?.to_std_string_escaped();
            Ok(store
                .borrow()
                .get(&key)
                .map_or(JsValue::null(), |v| string(v).into()))
        })
    };
    let set_item = {
        let store = store.clone();
        host_fn(move |_this, args, ctx| {
            let key = args.get_or_undefined(0).to_string(ctx)?.to_std_string_escaped();
            let value = args.get_or_undefined(1).to_string(ctx)?.to_std_string_escaped();
            store.borrow_mut().set(key, value);
            Ok(JsValue::undefined())
        })
    };
    let remove_item = {
        let store = store.clone();
        host_fn(move |_this, args, ctx| {
            let key = args.get_or_undefined(0).to_string(ctx)?.to_std_string_escaped();
            store.borrow_mut().remove(&key);
            Ok(JsValue::undefined())
        })
    };
    let clear = {
        let store = store.clone();
        host_fn(move |_this, _args, _ctx| {
            store.borrow_mut().clear();
            Ok(JsValue::undefined())
        })
    };
    let key = {
        let store = store.clone();
        host_fn(move |_this, args, ctx| {
            let index = args.get_or_undefined(0).to_number(ctx)?;
            if !index.is_finite() || index < 0.0 {
                return Ok(JsValue::null());
            }
            Ok(store
                .borrow()
                .key(index as usize)
                .map_or(JsValue::null(), |k| string(k).into()))
        })
    };
    let length = {
        let store = store.clone();
        getter(
            context,
            "length",
            host_fn(move |_this, _args, _ctx| Ok((store.borrow().len() as u32).into())),
        )
    };

    ObjectInitializer::new(context)
        .function(get_item, string("getItem"), 1)
        .function(set_item, string("setItem"), 2)
        .function(remove_item, string("removeItem"), 1)
        .function(clear, string("clear"), 0)
        .function(key, string("key"), 1)
        .accessor(
            string("length"),
            Some(length),
            None,
            Attribute::CONFIGURABLE | Attribute::ENUMERABLE,
        )
        .build()
}

fn install_window_properties(
    context: &mut Context,
    profile: &EnvironmentProfile,
    location: &RefererLocation,
) -> JsResult<()> {
    let geometry = profile.geometry;
    register(context, "devicePixelRatio", geometry.device_pixel_ratio)?;
    register(context, "innerWidth", geometry.inner_width)?;
    register(context, "innerHeight", geometry.inner_height)?;
    register(context, "outerWidth", geometry.outer_width)?;
    register(context, "outerHeight", geometry.outer_height)?;
    for name in [
        "screenX",
        "screenY",
        "screenLeft",
        "screenTop",
        "scrollX",
        "scrollY",
        "pageXOffset",
        "pageYOffset",
    ] {
        register(context, name, 0)?;
    }
    register(context, "name", string(""))?;
    register(context, "closed", false)?;
    register(context, "origin", string(&location.origin))?;
    register(context, "isSecureContext", location.protocol == "https:")?;

    let history = ObjectInitializer::new(context)
        .property(string("length"), 1, Attribute::all())
        .build();
    register(context, "history", history)?;

    let started = Instant::now();
    let now = host_fn(move |_this, _args, _ctx| {
        Ok((started.elapsed().as_secs_f64() * 1000.0).into())
    });
    let performance = ObjectInitializer::new(context)
        .function(now, string("now"), 0)
        .build();
    register(context, "performance", performance)
}

fn install_functions(context: &mut Context) -> JsResult<()> {
    let natives: [(&str, usize, fn(&JsValue, &[JsValue], &mut Context) -> JsResult<JsValue>); 6] = [
        ("btoa", 1, btoa),
        ("atob", 1, atob),
        ("matchMedia", 1, match_media),
        ("addEventListener", 2, element::noop),
        ("removeEventListener", 2, element::noop),
        ("dispatchEvent", 1, true_fn),
    ];
    for (name, length, function) in natives {
        context.register_global_builtin_callable(
            string(name),
            length,
            NativeFunction::from_fn_ptr(function),
        )?;
    }

    let mut console = ObjectInitializer::new(context);
    console
        .function(NativeFunction::from_fn_ptr(console_debug), string("log"), 0)
        .function(NativeFunction::from_fn_ptr(console_debug), string("debug"), 0)
        .function(NativeFunction::from_fn_ptr(console_debug), string("info"), 0)
        .function(NativeFunction::from_fn_ptr(console_warn), string("warn"), 0)
        .function(NativeFunction::from_fn_ptr(console_error), string("error"), 0);
    let console = console.build();
    register(context, "console", console)
}

fn install_prelude(context: &mut Context, env: &HostEnvironment) -> JsResult<Dispatchers> {
    let factory = context.eval(Source::from_bytes(PRELUDE))?;
    let factory = factory
        .as_callable()
        .cloned()
        .ok_or_else(|| JsNativeError::typ().with_message("prelude is not a function"))?;

    let mut bindings = ObjectInitializer::new(context);
    crate::network::register_bindings(&mut bindings, &env.network);
    register_timer_bindings(&mut bindings, &env.timers);
    let bindings = bindings.build();

    let exports = factory.call(&JsValue::undefined(), &[bindings.into()], context)?;
    let exports = exports
        .as_object()
        .cloned()
        .ok_or_else(|| JsNativeError::typ().with_message("prelude returned no exports"))?;

    for name in [
        "XMLHttpRequest",
        "setTimeout",
        "setInterval",
        "clearTimeout",
        "clearInterval",
    ] {
        let value = exports.get(string(name), context)?;
        register(context, name, value)?;
    }

    Ok(Dispatchers {
        complete_request: export_fn(&exports, "completeRequest", context)?,
        fire_timer: export_fn(&exports, "fireTimer", context)?,
    })
}

fn export_fn(exports: &JsObject, name: &str, context: &mut Context) -> JsResult<JsObject> {
    exports
        .get(string(name), context)?
        .as_callable()
        .cloned()
        .ok_or_else(|| {
            JsNativeError::typ()
                .with_message(format!("prelude export {name} is not callable"))
                .into()
        })
}

fn register_timer_bindings(init: &mut ObjectInitializer<'_>, timers: &Rc<RefCell<TimerQueue>>) {
    let schedule = {
        let timers = timers.clone();
        host_fn(move |_this, args, ctx| {
            let delay = args.get_or_undefined(0).to_number(ctx)?;
            let repeat = args.get_or_undefined(1).to_boolean();
            let delay = Duration::from_millis(delay.clamp(0.0, MAX_TIMER_DELAY_MS) as u64);
            Ok(timers
                .borrow_mut()
                .schedule(Instant::now(), delay, repeat)
                .into())
        })
    };
    let cancel = {
        let timers = timers.clone();
        host_fn(move |_this, args, ctx| {
            let id = args.get_or_undefined(0).to_u32(ctx)?;
            timers.borrow_mut().cancel(id);
            Ok(JsValue::undefined())
        })
    };
    init.function(schedule, string("schedule"), 2)
        .function(cancel, string("cancel"), 1);
}

fn create_element(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let tag = args.get_or_undefined(0).to_string(ctx)?.to_std_string_escaped();
    Ok(Element::create(&tag).into_object(ctx).into())
}

fn empty_list(_this: &JsValue, _args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    Ok(JsArray::new(ctx).into())
}

fn true_fn(_this: &JsValue, _args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    Ok(true.into())
}

fn false_fn(_this: &JsValue, _args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    Ok(false.into())
}

fn match_media(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let media = args.get_or_undefined(0).to_string(ctx)?;
    let mut init = ObjectInitializer::new(ctx);
    init.property(string("matches"), false, Attribute::all())
        .property(string("media"), media, Attribute::all());
    for name in [
        "addListener",
        "removeListener",
        "addEventListener",
        "removeEventListener",
    ] {
        init.function(NativeFunction::from_fn_ptr(element::noop), string(name), 1);
    }
    Ok(init.build().into())
}

/// Encode a Latin-1 string as base64, as `btoa` does.
///
/// Returns `None` if any character is outside Latin-1.
#[must_use]
pub fn encode_latin1(input: &str) -> Option<String> {
    let bytes = input
        .chars()
        .map(|c| u8::try_from(u32::from(c)).ok())
        .collect::<Option<Vec<u8>>>()?;
    Some(STANDARD.encode(bytes))
}

/// Decode base64 into a Latin-1 string, as `atob` does.
///
/// ASCII whitespace is ignored and padding is optional. Returns `None` for
/// malformed input.
#[must_use]
pub fn decode_latin1(input: &str) -> Option<String> {
    let compact: String = input.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = FORGIVING.decode(compact).ok()?;
    Some(bytes.into_iter().map(char::from).collect())
}

fn invalid_character(function: &str) -> boa_engine::JsError {
    JsNativeError::error()
        .with_message(format!(
            "InvalidCharacterError: {function}: the string contains invalid characters"
        ))
        .into()
}

fn btoa(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let input = args
        .get_or_undefined(0)
        .to_string(ctx)?
        .to_std_string()
        .map_err(|_| invalid_character("btoa"))?;
    let encoded = encode_latin1(&input).ok_or_else(|| invalid_character("btoa"))?;
    Ok(string(&encoded).into())
}

fn atob(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let input = args.get_or_undefined(0).to_string(ctx)?.to_std_string_escaped();
    let decoded = decode_latin1(&input).ok_or_else(|| invalid_character("atob"))?;
    Ok(string(&decoded).into())
}

fn console_line(args: &[JsValue]) -> String {
    args.iter()
        .map(|arg| match arg.as_string() {
            Some(s) => s.to_std_string_escaped(),
            None => arg.display().to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn console_debug(_this: &JsValue, args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    tracing::debug!(target: "devid::console", "{}", console_line(args));
    Ok(JsValue::undefined())
}

fn console_warn(_this: &JsValue, args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    tracing::warn!(target: "devid::console", "{}", console_line(args));
    Ok(JsValue::undefined())
}

fn console_error(_this: &JsValue, args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    tracing::error!(target: "devid::console", "{}", console_line(args));
    Ok(JsValue::undefined())
}
