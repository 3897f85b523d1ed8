use std::sync::OnceLock;

use crate::{Context, MethodInfo, Result, Status};

/// Introspection service registered on every built router.
#[crate::service]
pub trait MetaService {
    /// Every registered method with its call shape, sorted by name.
    async fn list_methods(&self, ctx: &Context, req: &()) -> Result<Vec<MethodInfo>>;
}

#[derive(Debug, Default)]
pub struct MetaServiceImpl {
    methods: OnceLock<Vec<MethodInfo>>,
}

impl MetaServiceImpl {
    /// Fixes the method table once the router is complete.
    pub fn set_methods(&self, methods: Vec<MethodInfo>) {
        if self.methods.set(methods).is_err() {
            tracing::warn!("method table of MetaService is already set");
        }
    }
}

impl MetaService for MetaServiceImpl {
    async fn list_methods(&self, _ctx: &Context, (): &()) -> Result<Vec<MethodInfo>> {
        self.methods
            .get()
            .cloned()
            .ok_or_else(|| Status::internal("router is not built yet"))
    }
}
