//! Elements returned by `document.createElement`.
//!
//! Only two shapes exist: a canvas that answers drawing and export calls with
//! deterministic stubs, and an inert element for every other tag.

use boa_engine::object::ObjectInitializer;
use boa_engine::object::builtins::JsArray;
use boa_engine::property::Attribute;
use boa_engine::{Context, JsArgs, JsObject, JsResult, JsString, JsValue, NativeFunction};

/// Image returned by `canvas.toDataURL()` (a 1x1 transparent PNG).
pub const CANVAS_DATA_URL: &str = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

/// Width reported by `measureText` for any input.
pub const MEASURED_TEXT_WIDTH: f64 = 10.0;

const CONTEXT_2D_NOOPS: &[&str] = &[
    "arc",
    "arcTo",
    "beginPath",
    "bezierCurveTo",
    "clearRect",
    "clip",
    "closePath",
    "drawImage",
    "ellipse",
    "fill",
    "fillRect",
    "fillText",
    "lineTo",
    "moveTo",
    "putImageData",
    "quadraticCurveTo",
    "rect",
    "resetTransform",
    "restore",
    "rotate",
    "save",
    "scale",
    "setLineDash",
    "setTransform",
    "stroke",
    "strokeRect",
    "strokeText",
    "transform",
    "translate",
];

const ELEMENT_NOOPS: &[&str] = &[
    "addEventListener",
    "removeEventListener",
    "setAttribute",
    "removeAttribute",
    "click",
    "focus",
    "blur",
    "remove",
];

/// An element created by the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    /// `<canvas>` with its default size.
    Canvas {
        /// Initial `width`.
        width: u32,
        /// Initial `height`.
        height: u32,
    },
    /// Any other tag.
    Generic {
        /// Upper-cased tag name.
        tag: String,
    },
}

impl Element {
    /// Pick the element shape for `tag`.
    #[must_use]
    pub fn create(tag: &str) -> Self {
        if tag.trim().eq_ignore_ascii_case("canvas") {
            Self::Canvas {
                width: 300,
                height: 150,
            }
        } else {
            Self::Generic {
                tag: tag.trim().to_ascii_uppercase(),
            }
        }
    }

    /// `tagName` as the script sees it.
    #[must_use]
    pub fn tag_name(&self) -> &str {
        match self {
            Self::Canvas { .. } => "CANVAS",
            Self::Generic { tag } => tag,
        }
    }

    /// Materialize the element as a script object.
    pub fn into_object(self, context: &mut Context) -> JsObject {
        let style = ObjectInitializer::new(context).build();
        let child_nodes = JsArray::new(context);
        let tag = JsString::from(self.tag_name());

        let mut init = ObjectInitializer::new(context);
        init.property(JsString::from("tagName"), tag.clone(), Attribute::all())
            .property(JsString::from("nodeName"), tag, Attribute::all())
            .property(JsString::from("nodeType"), 1, Attribute::all())
            .property(JsString::from("style"), style, Attribute::all())
            .property(JsString::from("childNodes"), child_nodes, Attribute::all())
            .property(JsString::from("innerHTML"), JsString::from(""), Attribute::all())
            .property(JsString::from("textContent"), JsString::from(""), Attribute::all())
            .property(JsString::from("offsetWidth"), 0, Attribute::all())
            .property(JsString::from("offsetHeight"), 0, Attribute::all())
            .function(NativeFunction::from_fn_ptr(null_fn), JsString::from("getAttribute"), 1)
            .function(NativeFunction::from_fn_ptr(first_arg), JsString::from("appendChild"), 1)
            .function(NativeFunction::from_fn_ptr(first_arg), JsString::from("removeChild"), 1)
            .function(NativeFunction::from_fn_ptr(first_arg), JsString::from("insertBefore"), 2)
            .function(
                NativeFunction::from_fn_ptr(bounding_rect),
                JsString::from("getBoundingClientRect"),
                0,
            );
        for name in ELEMENT_NOOPS {
            init.function(NativeFunction::from_fn_ptr(noop), JsString::from(*name), 0);
        }

        if let Self::Canvas { width, height } = self {
            init.property(JsString::from("width"), width, Attribute::all())
                .property(JsString::from("height"), height, Attribute::all())
                .function(NativeFunction::from_fn_ptr(get_context), JsString::from("getContext"), 1)
                .function(NativeFunction::from_fn_ptr(to_data_url), JsString::from("toDataURL"), 0)
                .function(NativeFunction::from_fn_ptr(noop), JsString::from("toBlob"), 1);
        }

        init.build()
    }
}

pub(crate) fn noop(_this: &JsValue, _args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    Ok(JsValue::undefined())
}

pub(crate) fn null_fn(_this: &JsValue, _args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    Ok(JsValue::null())
}

fn first_arg(_this: &JsValue, args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    Ok(args.get_or_undefined(0).clone())
}

fn bounding_rect(_this: &JsValue, _args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let mut init = ObjectInitializer::new(ctx);
    for name in ["x", "y", "top", "left", "right", "bottom", "width", "height"] {
        init.property(JsString::from(name), 0, Attribute::all());
    }
    Ok(init.build().into())
}

fn to_data_url(_this: &JsValue, _args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    Ok(JsString::from(CANVAS_DATA_URL).into())
}

/// `canvas.getContext(type)`: a stub 2D context, `null` for anything else.
fn get_context(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let kind = args.get_or_undefined(0).to_string(ctx)?.to_std_string_escaped();
    if kind != "2d" {
        return Ok(JsValue::null());
    }

    let mut init = ObjectInitializer::new(ctx);
    init.property(JsString::from("fillStyle"), JsString::from("#000000"), Attribute::all())
        .property(JsString::from("strokeStyle"), JsString::from("#000000"), Attribute::all())
        .property(JsString::from("font"), JsString::from("10px sans-serif"), Attribute::all())
        .property(JsString::from("textBaseline"), JsString::from("alphabetic"), Attribute::all())
        .property(JsString::from("textAlign"), JsString::from("start"), Attribute::all())
        .property(
            JsString::from("globalCompositeOperation"),
            JsString::from("source-over"),
            Attribute::all(),
        )
        .property(JsString::from("globalAlpha"), 1, Attribute::all())
        .property(JsString::from("lineWidth"), 1, Attribute::all())
        .function(NativeFunction::from_fn_ptr(measure_text), JsString::from("measureText"), 1)
        .function(NativeFunction::from_fn_ptr(image_data), JsString::from("getImageData"), 4)
        .function(NativeFunction::from_fn_ptr(image_data), JsString::from("createImageData"), 2)
        .function(NativeFunction::from_fn_ptr(gradient), JsString::from("createLinearGradient"), 4)
        .function(NativeFunction::from_fn_ptr(gradient), JsString::from("createRadialGradient"), 6)
        .function(NativeFunction::from_fn_ptr(gradient), JsString::from("createPattern"), 2)
        .function(NativeFunction::from_fn_ptr(is_point_in_path), JsString::from("isPointInPath"), 2);
    for name in CONTEXT_2D_NOOPS {
        init.function(NativeFunction::from_fn_ptr(noop), JsString::from(*name), 0);
    }
    Ok(init.build().into())
}

fn measure_text(_this: &JsValue, _args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let metrics = ObjectInitializer::new(ctx)
        .property(JsString::from("width"), MEASURED_TEXT_WIDTH, Attribute::all())
        .build();
    Ok(metrics.into())
}

fn image_data(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let width = args.get_or_undefined(2).to_u32(ctx)?;
    let height = args.get_or_undefined(3).to_u32(ctx)?;
    let data = JsArray::new(ctx);
    let image = ObjectInitializer::new(ctx)
        .property(JsString::from("width"), width, Attribute::all())
        .property(JsString::from("height"), height, Attribute::all())
        .property(JsString::from("data"), data, Attribute::all())
        .build();
    Ok(image.into())
}

fn gradient(_this: &JsValue, _args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let gradient = ObjectInitializer::new(ctx)
        .function(NativeFunction::from_fn_ptr(noop), JsString::from("addColorStop"), 2)
        .build();
    Ok(gradient.into())
}

fn is_point_in_path(_this: &JsValue, _args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    Ok(false.into())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use boa_engine::Source;

    use super::*;

    fn eval_with_element(tag: &str, expr: &str) -> String {
        let mut context = Context::default();
        let element = Element::create(tag).into_object(&mut context);
        context
            .register_global_property(JsString::from("el"), element, Attribute::all())
            .unwrap();
        let value = context.eval(Source::from_bytes(expr)).unwrap();
        value.to_string(&mut context).unwrap().to_std_string_escaped()
    }

    #[test]
    fn test_factory_picks_shape_by_tag() {
        assert_eq!(
            Element::create("Canvas"),
            Element::Canvas {
                width: 300,
                height: 150
            }
        );
        assert_eq!(Element::create("div").tag_name(), "DIV");
    }

    #[test]
    fn test_canvas_is_deterministic() {
        assert_eq!(eval_with_element("canvas", "el.toDataURL()"), CANVAS_DATA_URL);
        assert_eq!(
            eval_with_element(
                "canvas",
                "var c = el.getContext('2d'); c.fillText('hi', 0, 0); c.measureText('anything').width"
            ),
            "10"
        );
        assert_eq!(eval_with_element("canvas", "el.getContext('webgl')"), "null");
        assert_eq!(eval_with_element("canvas", "el.width + 'x' + el.height"), "300x150");
    }

    #[test]
    fn test_generic_element_is_inert() {
        assert_eq!(eval_with_element("div", "el.tagName"), "DIV");
        assert_eq!(eval_with_element("div", "el.getAttribute('id')"), "null");
        assert_eq!(eval_with_element("div", "typeof el.getContext"), "undefined");
        assert_eq!(eval_with_element("span", "el.appendChild(42)"), "42");
    }
}
