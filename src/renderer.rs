use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::compiler::compile_str;
use crate::config::EngineConfig;
use crate::context::{Context, IterationMeta};
use crate::deferred::OutputChain;
use crate::error::{FuyuzoraError, Result};
use crate::helper::{BlockHelper, HelperBlock};
use crate::html_escape;
use crate::resolver::{Hint, ResolverChain};
use crate::segment::{
    BlockSegment, ExtendSegment, Origin, PartialSegment, RootSegment, Segment, TextSegment,
    ValueSegment,
};
use crate::template::{Template, TemplateLocator};
use crate::value::{LambdaKind, Value};

/// Everything a render needs, cheap to clone into a worker thread.
#[derive(Clone)]
pub(crate) struct RenderEnv {
    pub config: EngineConfig,
    pub chain: Arc<ResolverChain>,
    pub locator: Option<Arc<dyn TemplateLocator>>,
    pub helpers: Arc<HashMap<String, Arc<dyn BlockHelper>>>,
}

/// Tree-walking execution engine. One renderer serves any number of render
/// calls; all per-render state lives in the [`Context`] and [`OutputChain`].
pub(crate) struct Renderer {
    env: RenderEnv,
}

impl Renderer {
    pub fn new(env: RenderEnv) -> Self {
        Self { env }
    }

    pub fn env_clone(&self) -> RenderEnv {
        self.env.clone()
    }

    pub fn chain(&self) -> &ResolverChain {
        &self.env.chain
    }

    pub fn render_template(&self, template: &Template, data: Value) -> Result<String> {
        let mut context = Context::new(data);
        self.render_template_with(template, &mut context)
    }

    pub fn render_template_with(
        &self,
        template: &Template,
        context: &mut Context,
    ) -> Result<String> {
        let mut out = OutputChain::new();
        context.push_invocation(template.name_arc());
        let result = match template.root() {
            Some(root) => self.render_segment(root, context, &mut out),
            None => Ok(()),
        };
        context.pop_invocation();
        result?;
        out.finish(self.env.config.deferred_join_timeout)
    }

    pub fn render_segments_to_string(
        &self,
        segments: &[Segment],
        context: &mut Context,
    ) -> Result<String> {
        let mut out = OutputChain::new();
        self.render_segments(segments, context, &mut out)?;
        out.finish(self.env.config.deferred_join_timeout)
    }

    pub fn render_segments(
        &self,
        segments: &[Segment],
        context: &mut Context,
        out: &mut OutputChain,
    ) -> Result<()> {
        for segment in segments {
            self.render_segment(segment, context, out)?;
        }
        Ok(())
    }

    fn render_segment(
        &self,
        segment: &Segment,
        context: &mut Context,
        out: &mut OutputChain,
    ) -> Result<()> {
        match segment {
            Segment::Root(root) => self.render_segments(&root.children, context, out),
            Segment::Text(text) => {
                out.push_str(&text.text);
                Ok(())
            }
            Segment::LineSeparator(sep) => {
                out.push_str(sep.text);
                Ok(())
            }
            // Render no-ops, present only when clean-up passes are disabled.
            Segment::Comment(_) | Segment::SetDelimiters(_) => Ok(()),
            Segment::Value(value) => self.render_value(value, context, out),
            Segment::Section(block) => self.render_section(block, context, out),
            Segment::InvertedSection(block) => self.render_inverted(block, context, out),
            Segment::Partial(partial) => self.render_partial(partial, context, out),
            Segment::Extend(extend) => self.render_extend(extend, context, out),
            Segment::ExtendSection(block) => self.render_extend_section(block, context, out),
        }
    }

    fn lookup(
        &self,
        context: &Context,
        key: &str,
        hint: &OnceCell<Hint>,
    ) -> Option<Value> {
        context.lookup(
            key,
            &self.env.chain,
            Some(hint),
            self.env.config.resolver_hints,
        )
    }

    fn render_value(
        &self,
        segment: &ValueSegment,
        context: &mut Context,
        out: &mut OutputChain,
    ) -> Result<()> {
        let Some(value) = self.lookup(context, &segment.key, &segment.hint) else {
            if self.env.config.missing_is_error {
                return Err(FuyuzoraError::MissingValue {
                    key: segment.key.clone(),
                    origin: segment.origin.clone(),
                });
            }
            return Ok(());
        };

        if let Value::Lambda(lambda) = &value {
            let returned = lambda.invoke("");
            return match lambda.kind() {
                LambdaKind::Literal => {
                    out.push_str(&returned);
                    Ok(())
                }
                LambdaKind::Interpolated => self.render_one_off(&returned, context, out),
            };
        }

        let text = value.stringify()?;
        if self.env.config.escape_values && !segment.unescape {
            out.push_str(&html_escape::escape(&text));
        } else {
            out.push_str(&text);
        }
        Ok(())
    }

    fn render_section(
        &self,
        segment: &BlockSegment,
        context: &mut Context,
        out: &mut OutputChain,
    ) -> Result<()> {
        if let Some(helper) = self.env.helpers.get(&segment.key).cloned() {
            return self.invoke_helper(&helper, segment, context, out);
        }

        let Some(value) = self.lookup(context, &segment.key, &segment.hint) else {
            return Ok(());
        };
        match value {
            Value::Null | Value::Bool(false) => Ok(()),
            Value::Bool(true) => self.render_segments(&segment.children, context, out),
            Value::Array(items) => self.render_iteration(segment, items, context, out),
            Value::Lambda(lambda) => match lambda.kind() {
                LambdaKind::Literal => {
                    let returned = lambda.invoke(segment.literal());
                    out.push_str(&returned);
                    Ok(())
                }
                LambdaKind::Interpolated => {
                    let processed = self.render_segments_to_string(&segment.children, context)?;
                    let returned = lambda.invoke(&processed);
                    self.render_one_off(&returned, context, out)
                }
            },
            other => {
                context.push(other);
                let result = self.render_segments(&segment.children, context, out);
                context.pop();
                result
            }
        }
    }

    fn render_iteration(
        &self,
        segment: &BlockSegment,
        items: Vec<Value>,
        context: &mut Context,
        out: &mut OutputChain,
    ) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let length = items.len();
        let meta_slot = context.depth();
        context.push(Value::Iteration(IterationMeta::new(0, length)));
        let mut result = Ok(());
        for (position, item) in items.into_iter().enumerate() {
            context.replace(meta_slot, Value::Iteration(IterationMeta::new(position, length)));
            context.push(item);
            result = self.render_segments(&segment.children, context, out);
            context.pop();
            if result.is_err() {
                break;
            }
        }
        context.pop();
        result
    }

    fn render_inverted(
        &self,
        segment: &BlockSegment,
        context: &mut Context,
        out: &mut OutputChain,
    ) -> Result<()> {
        let suppressed = self
            .lookup(context, &segment.key, &segment.hint)
            .map_or(false, |value| value.is_truthy());
        if suppressed {
            Ok(())
        } else {
            self.render_segments(&segment.children, context, out)
        }
    }

    fn invoke_helper(
        &self,
        helper: &Arc<dyn BlockHelper>,
        segment: &BlockSegment,
        context: &mut Context,
        out: &mut OutputChain,
    ) -> Result<()> {
        let mut block = HelperBlock {
            name: &segment.key,
            children: &segment.children,
            renderer: self,
            context: &mut *context,
            out: &mut *out,
            pushes: 0,
        };
        helper.render(&mut block)?;
        let leftover = block.pushes;
        if leftover != 0 {
            for _ in 0..leftover {
                context.pop();
            }
            return Err(FuyuzoraError::HelperStackDiscipline {
                helper: segment.key.clone(),
            });
        }
        Ok(())
    }

    /// Compile and render a lambda's return value as a one-off template
    /// against the current context.
    fn render_one_off(
        &self,
        source: &str,
        context: &mut Context,
        out: &mut OutputChain,
    ) -> Result<()> {
        let template = compile_str("<lambda>", source, &self.env.config)?;
        if let Some(root) = template.root() {
            self.render_segment(root, context, out)?;
        }
        Ok(())
    }

    fn render_partial(
        &self,
        segment: &PartialSegment,
        context: &mut Context,
        out: &mut OutputChain,
    ) -> Result<()> {
        let resolved = self.resolve_named(&segment.resolved, &segment.key, &segment.origin)?;
        let target = match &segment.indentation {
            Some(indent) => {
                if self.env.config.cache_partials {
                    segment
                        .indented
                        .get_or_try_init(|| indent_template(&resolved, indent).map(Arc::new))?
                        .clone()
                } else {
                    Arc::new(indent_template(&resolved, indent)?)
                }
            }
            None => resolved,
        };
        context.push_invocation(target.name_arc());
        let result = match target.root() {
            Some(root) => self.render_segment(root, context, out),
            None => Ok(()),
        };
        context.pop_invocation();
        result
    }

    fn render_extend(
        &self,
        segment: &ExtendSegment,
        context: &mut Context,
        out: &mut OutputChain,
    ) -> Result<()> {
        let base = self.resolve_named(&segment.resolved, &segment.key, &segment.origin)?;
        let added = context.register_defining(&segment.overrides);
        context.push_invocation(base.name_arc());
        let result = match base.root() {
            Some(root) => self.render_segment(root, context, out),
            None => Ok(()),
        };
        context.pop_invocation();
        context.unwind_defining(added);
        result
    }

    fn render_extend_section(
        &self,
        segment: &BlockSegment,
        context: &mut Context,
        out: &mut OutputChain,
    ) -> Result<()> {
        match context.find_defining(&segment.key) {
            Some(defining) => {
                // An override rendering its own name falls through to the
                // defaults instead of recursing into itself.
                if !context.begin_override(&segment.key) {
                    return self.render_segments(&segment.children, context, out);
                }
                let result = self.render_segments(&defining.children, context, out);
                context.end_override(&segment.key);
                result
            }
            None => self.render_segments(&segment.children, context, out),
        }
    }

    fn resolve_named(
        &self,
        cell: &OnceCell<Arc<Template>>,
        key: &str,
        origin: &Origin,
    ) -> Result<Arc<Template>> {
        if self.env.config.cache_partials {
            let cached = cell.get_or_try_init(|| self.locate(key, origin))?;
            return Ok(cached.clone());
        }
        self.locate(key, origin)
    }

    fn locate(&self, key: &str, origin: &Origin) -> Result<Arc<Template>> {
        let found = self
            .env
            .locator
            .as_ref()
            .and_then(|locator| locator.locate(key));
        match found {
            Some(template) => {
                log::debug!("resolved partial '{}' for {}", key, origin);
                Ok(template)
            }
            None => Err(FuyuzoraError::UnknownPartial {
                name: key.to_string(),
                origin: origin.clone(),
            }),
        }
    }
}

/// Build a derived template with the captured indentation prepended to each
/// output line of the source template's root.
fn indent_template(source: &Template, indent: &str) -> Result<Template> {
    let name = source.name_arc();
    let indent_text = || {
        Segment::Text(TextSegment {
            text: indent.to_string(),
            origin: Origin::synthetic(name.clone()),
        })
    };
    let mut children = vec![indent_text()];
    if let Some(Segment::Root(root)) = source.root() {
        let count = root.children.len();
        for (i, child) in root.children.iter().enumerate() {
            children.push(child.clone());
            if matches!(child, Segment::LineSeparator(_)) && i + 1 < count {
                children.push(indent_text());
            }
        }
    }
    let template = Template::new(name);
    template.attach_root(RootSegment { children })?;
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::MapLocator;
    use crate::value::Lambda;
    use serde_json::json;

    fn env() -> RenderEnv {
        let config = EngineConfig::default();
        RenderEnv {
            chain: Arc::new(ResolverChain::new(config.member_cache_capacity)),
            config,
            locator: None,
            helpers: Arc::new(HashMap::new()),
        }
    }

    fn render(source: &str, data: serde_json::Value) -> Result<String> {
        render_env(source, data, env())
    }

    fn render_env(source: &str, data: serde_json::Value, env: RenderEnv) -> Result<String> {
        let template = compile_str("test", source, &env.config)?;
        Renderer::new(env).render_template(&template, Value::from_json(data)?)
    }

    fn render_value(source: &str, data: Value) -> Result<String> {
        let env = env();
        let template = compile_str("test", source, &env.config)?;
        Renderer::new(env).render_template(&template, data)
    }

    #[test]
    fn test_render_text() {
        let result = render("Hello, world!", json!({})).unwrap();
        assert_eq!(result, "Hello, world!");
    }

    #[test]
    fn test_render_variable() {
        let result = render("Hi {{name}}!", json!({"name": "Mo"})).unwrap();
        assert_eq!(result, "Hi Mo!");
    }

    #[test]
    fn test_render_variable_escaped() {
        let result = render("{{html}}", json!({"html": "<b>&</b>"})).unwrap();
        assert_eq!(result, "&lt;b&gt;&amp;&lt;/b&gt;");
    }

    #[test]
    fn test_render_variable_unescaped() {
        let result = render("{{{html}}}", json!({"html": "<b>"})).unwrap();
        assert_eq!(result, "<b>");
        let result = render("{{&html}}", json!({"html": "<b>"})).unwrap();
        assert_eq!(result, "<b>");
    }

    #[test]
    fn test_escaping_disabled_globally() {
        let mut env = env();
        env.config.escape_values = false;
        let result = render_env("{{html}}", json!({"html": "<b>"}), env).unwrap();
        assert_eq!(result, "<b>");
    }

    #[test]
    fn test_missing_value_renders_empty() {
        let result = render("[{{missing}}]", json!({})).unwrap();
        assert_eq!(result, "[]");
    }

    #[test]
    fn test_missing_value_strict_mode() {
        let mut env = env();
        env.config.missing_is_error = true;
        let err = render_env("{{missing}}", json!({}), env).unwrap_err();
        assert!(matches!(err, FuyuzoraError::MissingValue { key, .. } if key == "missing"));
    }

    #[test]
    fn test_section_boolean() {
        assert_eq!(render("{{#on}}yes{{/on}}", json!({"on": true})).unwrap(), "yes");
        assert_eq!(render("{{#on}}yes{{/on}}", json!({"on": false})).unwrap(), "");
    }

    #[test]
    fn test_section_null_and_missing() {
        assert_eq!(render("{{#x}}yes{{/x}}", json!({"x": null})).unwrap(), "");
        assert_eq!(render("{{#x}}yes{{/x}}", json!({})).unwrap(), "");
    }

    #[test]
    fn test_section_iteration() {
        let result = render(
            "{{#items}}{{.}},{{/items}}",
            json!({"items": ["a", "b"]}),
        )
        .unwrap();
        assert_eq!(result, "a,b,");
        let result = render("{{#items}}{{.}},{{/items}}", json!({"items": []})).unwrap();
        assert_eq!(result, "");
    }

    #[test]
    fn test_section_iteration_meta() {
        let result = render(
            "{{#items}}{{index}}:{{.}}{{#hasNext}} {{/hasNext}}{{/items}}",
            json!({"items": ["a", "b", "c"]}),
        )
        .unwrap();
        assert_eq!(result, "1:a 2:b 3:c");
    }

    #[test]
    fn test_section_iteration_meta_dotted() {
        let result = render(
            "{{#items}}{{iter.position}}{{/items}}",
            json!({"items": ["a", "b", "c"]}),
        )
        .unwrap();
        assert_eq!(result, "012");
    }

    #[test]
    fn test_section_pushes_map_context() {
        let result = render(
            "{{#user}}{{name}}{{/user}}",
            json!({"user": {"name": "Alice"}}),
        )
        .unwrap();
        assert_eq!(result, "Alice");
    }

    #[test]
    fn test_section_context_climbs() {
        let result = render(
            "{{#user}}{{name}} of {{org}}{{/user}}",
            json!({"user": {"name": "Alice"}, "org": "Acme"}),
        )
        .unwrap();
        assert_eq!(result, "Alice of Acme");
    }

    #[test]
    fn test_inverted_section() {
        assert_eq!(
            render("{{^items}}none{{/items}}", json!({"items": []})).unwrap(),
            "none"
        );
        assert_eq!(
            render("{{^items}}none{{/items}}", json!({"items": ["x"]})).unwrap(),
            ""
        );
        assert_eq!(render("{{^x}}none{{/x}}", json!({})).unwrap(), "none");
        assert_eq!(render("{{^x}}none{{/x}}", json!({"x": false})).unwrap(), "none");
        assert_eq!(render("{{^x}}none{{/x}}", json!({"x": true})).unwrap(), "");
    }

    #[test]
    fn test_value_lambda_literal() {
        let mut data = std::collections::HashMap::new();
        data.insert(
            "now".to_string(),
            Value::Lambda(Lambda::literal(|_| "<later>".to_string())),
        );
        let result = render_value("at {{now}}", Value::Map(data)).unwrap();
        assert_eq!(result, "at <later>");
    }

    #[test]
    fn test_value_lambda_interpolated() {
        let mut data = std::collections::HashMap::new();
        data.insert(
            "greet".to_string(),
            Value::Lambda(Lambda::interpolated(|_| "Hi {{name}}".to_string())),
        );
        data.insert("name".to_string(), Value::String("Mo".to_string()));
        let result = render_value("{{greet}}!", Value::Map(data)).unwrap();
        assert_eq!(result, "Hi Mo!");
    }

    #[test]
    fn test_section_lambda_literal_gets_block_source() {
        let mut data = std::collections::HashMap::new();
        data.insert(
            "wrap".to_string(),
            Value::Lambda(Lambda::literal(|block| format!("[{}]", block))),
        );
        let result = render_value("{{#wrap}}{{name}}{{/wrap}}", Value::Map(data)).unwrap();
        assert_eq!(result, "[{{#wrap}}{{name}}{{/wrap}}]");
    }

    #[test]
    fn test_section_lambda_interpolated_gets_rendered_body() {
        let mut data = std::collections::HashMap::new();
        data.insert(
            "shout".to_string(),
            Value::Lambda(Lambda::interpolated(|body| body.to_uppercase())),
        );
        data.insert("name".to_string(), Value::String("mo".to_string()));
        let result = render_value("{{#shout}}hi {{name}}{{/shout}}", Value::Map(data)).unwrap();
        assert_eq!(result, "HI MO");
    }

    #[test]
    fn test_partial() {
        let mut env = env();
        let locator = Arc::new(MapLocator::new());
        locator.insert("child", compile_str("child", "Hello from child", &env.config).unwrap());
        env.locator = Some(locator);
        let result = render_env("[{{>child}}]", json!({}), env).unwrap();
        assert_eq!(result, "[Hello from child]");
    }

    #[test]
    fn test_partial_sees_current_context() {
        let mut env = env();
        let locator = Arc::new(MapLocator::new());
        locator.insert("who", compile_str("who", "{{name}}", &env.config).unwrap());
        env.locator = Some(locator);
        let result = render_env("{{>who}}", json!({"name": "Mo"}), env).unwrap();
        assert_eq!(result, "Mo");
    }

    #[test]
    fn test_partial_indentation() {
        let mut env = env();
        let locator = Arc::new(MapLocator::new());
        locator.insert("child", compile_str("child", "L1\nL2", &env.config).unwrap());
        env.locator = Some(locator);
        let result = render_env("  {{>child}}\n", json!({}), env).unwrap();
        assert_eq!(result, "  L1\n  L2");
    }

    #[test]
    fn test_unknown_partial_is_fatal() {
        let err = render("{{>ghost}}", json!({})).unwrap_err();
        assert!(matches!(err, FuyuzoraError::UnknownPartial { name, .. } if name == "ghost"));
    }

    #[test]
    fn test_extend_with_override() {
        let mut env = env();
        let locator = Arc::new(MapLocator::new());
        locator.insert(
            "base",
            compile_str("base", "<{{$title}}default{{/title}}>", &env.config).unwrap(),
        );
        env.locator = Some(locator);
        let result = render_env(
            "{{<base}}{{$title}}custom{{/title}}{{/base}}",
            json!({}),
            env,
        )
        .unwrap();
        assert_eq!(result, "<custom>");
    }

    #[test]
    fn test_extend_without_override_uses_default() {
        let mut env = env();
        let locator = Arc::new(MapLocator::new());
        locator.insert(
            "base",
            compile_str("base", "<{{$title}}default{{/title}}>", &env.config).unwrap(),
        );
        env.locator = Some(locator);
        let result = render_env("{{<base}}{{/base}}", json!({}), env).unwrap();
        assert_eq!(result, "<default>");
    }

    #[test]
    fn test_extend_section_alone_renders_default() {
        let result = render("{{$title}}default{{/title}}", json!({})).unwrap();
        assert_eq!(result, "default");
    }

    #[test]
    fn test_nested_extend_outermost_wins() {
        let mut env = env();
        let locator = Arc::new(MapLocator::new());
        locator.insert(
            "grandparent",
            compile_str("grandparent", "[{{$x}}g{{/x}}]", &env.config).unwrap(),
        );
        locator.insert(
            "parent",
            compile_str(
                "parent",
                "{{<grandparent}}{{$x}}p{{/x}}{{/grandparent}}",
                &env.config,
            )
            .unwrap(),
        );
        env.locator = Some(locator);
        let result = render_env("{{<parent}}{{$x}}c{{/x}}{{/parent}}", json!({}), env).unwrap();
        assert_eq!(result, "[c]");
    }

    #[test]
    fn test_unknown_extend_target_is_fatal() {
        let err = render("{{<ghost}}{{/ghost}}", json!({})).unwrap_err();
        assert!(matches!(err, FuyuzoraError::UnknownPartial { name, .. } if name == "ghost"));
    }

    #[test]
    fn test_stringify_error_for_map_value() {
        let err = render("{{user}}", json!({"user": {"a": 1}})).unwrap_err();
        assert!(matches!(err, FuyuzoraError::TypeError { .. }));
    }

    #[test]
    fn test_comment_ignored() {
        let result = render("Hello{{! comment }}World", json!({})).unwrap();
        assert_eq!(result, "HelloWorld");
    }
}
