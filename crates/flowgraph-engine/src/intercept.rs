use std::sync::Arc;

use futures::future::BoxFuture;

use flowgraph_core::error::Result;

use crate::context::FlowContext;
use crate::engine::{Budget, FlowEngine, Outcome};
use crate::graph::{Graph, Node};
use crate::traits::FlowDriver;

/// Wraps whole runs and observes node boundaries, for every graph an engine
/// drives.
///
/// Unlike a [`FlowDriver`], which a caller picks per run, interceptors are
/// registered on the engine with [`FlowEngine::with_interceptor`] and chain
/// around each other.
pub trait FlowInterceptor: Send + Sync {
    /// Position in the chain. Lower runs first, so it sits outermost.
    fn priority(&self) -> i32 {
        100
    }

    /// Wrap one run. Call [`FlowInvocation::proceed`] to hand over to the
    /// next interceptor, or skip it to short-circuit the run.
    fn intercept_run<'a>(&'a self, invocation: FlowInvocation<'a>) -> BoxFuture<'a, Result<Outcome>> {
        invocation.proceed()
    }

    fn on_node_start(&self, ctx: &FlowContext, graph: &Graph, node: &Node) {
        let _ = (ctx, graph, node);
    }

    fn on_node_end(&self, ctx: &FlowContext, graph: &Graph, node: &Node) {
        let _ = (ctx, graph, node);
    }
}

/// One run travelling down the interceptor chain.
pub struct FlowInvocation<'a> {
    engine: &'a FlowEngine,
    remaining: &'a [Arc<dyn FlowInterceptor>],
    driver: &'a dyn FlowDriver,
    graph: &'a Graph,
    ctx: &'a mut FlowContext,
    budget: Budget,
}

impl<'a> FlowInvocation<'a> {
    pub(crate) fn new(
        engine: &'a FlowEngine,
        remaining: &'a [Arc<dyn FlowInterceptor>],
        driver: &'a dyn FlowDriver,
        graph: &'a Graph,
        ctx: &'a mut FlowContext,
        budget: Budget,
    ) -> Self {
        Self {
            engine,
            remaining,
            driver,
            graph,
            ctx,
            budget,
        }
    }

    pub fn graph(&self) -> &Graph {
        self.graph
    }

    pub fn context(&self) -> &FlowContext {
        self.ctx
    }

    pub fn context_mut(&mut self) -> &mut FlowContext {
        self.ctx
    }

    pub fn budget(&self) -> Budget {
        self.budget
    }

    /// Run the rest of the chain, then the traversal itself.
    pub fn proceed(self) -> BoxFuture<'a, Result<Outcome>> {
        let remaining = self.remaining;
        match remaining.split_first() {
            Some((next, rest)) => next.intercept_run(FlowInvocation { remaining: rest, ..self }),
            None => self.engine.walk(self.driver, self.graph, self.ctx, self.budget),
        }
    }
}

/// Build an interceptor from closures; handy in tests and small embeddings.
#[derive(Default)]
pub struct SimpleInterceptor {
    priority: i32,
    on_start: Option<Box<dyn Fn(&FlowContext, &Graph, &Node) + Send + Sync>>,
    on_end: Option<Box<dyn Fn(&FlowContext, &Graph, &Node) + Send + Sync>>,
}

impl SimpleInterceptor {
    pub fn new(priority: i32) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    pub fn on_start(mut self, f: impl Fn(&FlowContext, &Graph, &Node) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Box::new(f));
        self
    }

    pub fn on_end(mut self, f: impl Fn(&FlowContext, &Graph, &Node) + Send + Sync + 'static) -> Self {
        self.on_end = Some(Box::new(f));
        self
    }
}

impl FlowInterceptor for SimpleInterceptor {
    fn priority(&self) -> i32 {
        self.priority
    }

    fn on_node_start(&self, ctx: &FlowContext, graph: &Graph, node: &Node) {
        if let Some(f) = &self.on_start {
            f(ctx, graph, node);
        }
    }

    fn on_node_end(&self, ctx: &FlowContext, graph: &Graph, node: &Node) {
        if let Some(f) = &self.on_end {
            f(ctx, graph, node);
        }
    }
}

impl std::fmt::Debug for SimpleInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleInterceptor")
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}
