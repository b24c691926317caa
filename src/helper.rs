use crate::context::Context;
use crate::deferred::{spawn_block, OutputChain};
use crate::error::{FuyuzoraError, Result};
use crate::renderer::Renderer;
use crate::segment::Segment;
use crate::value::Value;

/// A user-registered block helper.
///
/// When a section key names a registered helper, the execution engine hands
/// the helper a [`HelperBlock`] instead of resolving the key as a value.
/// This is the whole contract; argument grammars and helper libraries live
/// outside the engine.
pub trait BlockHelper: Send + Sync {
    fn render(&self, block: &mut HelperBlock<'_>) -> Result<()>;
}

/// The engine-side view a helper renders through.
///
/// Context pushes made through the block must be popped before the helper
/// returns; an unbalanced push or pop is a fatal render error.
pub struct HelperBlock<'a> {
    pub(crate) name: &'a str,
    pub(crate) children: &'a [Segment],
    pub(crate) renderer: &'a Renderer,
    pub(crate) context: &'a mut Context,
    pub(crate) out: &'a mut OutputChain,
    pub(crate) pushes: usize,
}

impl<'a> HelperBlock<'a> {
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn write(&mut self, text: &str) {
        self.out.push_str(text);
    }

    /// Resolve a key against the current context stack.
    pub fn lookup(&self, key: &str) -> Option<Value> {
        self.context
            .lookup(key, self.renderer.chain(), None, false)
    }

    pub fn push_value(&mut self, value: Value) {
        self.context.push(value);
        self.pushes += 1;
    }

    pub fn pop_value(&mut self) -> Result<()> {
        if self.pushes == 0 {
            return Err(FuyuzoraError::HelperStackDiscipline {
                helper: self.name.to_string(),
            });
        }
        self.context.pop();
        self.pushes -= 1;
        Ok(())
    }

    /// Render the block body synchronously, in place.
    pub fn render_body(&mut self) -> Result<()> {
        self.renderer
            .render_segments(self.children, self.context, self.out)
    }

    /// Render the block body on a worker thread.
    ///
    /// The body renders into a private buffer against a snapshot of the
    /// current context; the buffer is spliced back in document order at the
    /// enclosing join point.
    pub fn defer_body(&mut self) -> Result<()> {
        let children = self.children.to_vec();
        let mut context = self.context.clone();
        let env = self.renderer.env_clone();
        let pending = spawn_block(self.name.to_string(), move || {
            Renderer::new(env).render_segments_to_string(&children, &mut context)
        })?;
        self.out.push_pending(pending);
        Ok(())
    }
}
