//! Resolves a plan and egg into the concrete server specification.

use std::collections::BTreeMap;
use std::sync::Arc;

use berth_id::UserId;
use chrono::{DateTime, Duration, Utc};

use crate::error::{ProvisionError, ProvisionResult};
use crate::model::{
    Allocation, Egg, FeatureLimits, Node, Plan, PlanActivation, ProvisionedSpec, ResourceLimits,
};
use crate::random::{choose, RandomSource};

/// Fixed policy applied to every server regardless of plan.
#[derive(Debug, Clone)]
pub struct SpecPolicy {
    pub io_weight: i64,
    pub trial_days: i64,
    pub standard_days: i64,
}

impl Default for SpecPolicy {
    fn default() -> Self {
        Self {
            io_weight: 500,
            trial_days: 7,
            standard_days: 30,
        }
    }
}

impl SpecPolicy {
    pub fn expiry_window(&self, plan: &Plan) -> Duration {
        if plan.trial {
            Duration::days(self.trial_days)
        } else {
            Duration::days(self.standard_days)
        }
    }
}

/// Everything the builder resolves from.
pub struct BuildInput<'a> {
    pub plan: &'a Plan,
    pub egg: &'a Egg,
    pub node: &'a Node,
    pub allocation: &'a Allocation,
    pub name: &'a str,
    pub owner: UserId,
    pub activated_on: DateTime<Utc>,
}

pub struct ProvisioningSpecBuilder {
    rng: Arc<dyn RandomSource>,
    policy: SpecPolicy,
}

impl ProvisioningSpecBuilder {
    pub fn new(rng: Arc<dyn RandomSource>, policy: SpecPolicy) -> Self {
        Self { rng, policy }
    }

    pub fn policy(&self) -> &SpecPolicy {
        &self.policy
    }

    /// Builds the spec. Touches no state; the only failure is an egg with no images.
    pub fn build(&self, input: BuildInput<'_>) -> ProvisionResult<ProvisionedSpec> {
        let BuildInput {
            plan,
            egg,
            node,
            allocation,
            name,
            owner,
            activated_on,
        } = input;

        let images: Vec<&String> = egg
            .docker_images
            .iter()
            .filter(|image| !image.trim().is_empty())
            .collect();
        let image = choose(self.rng.as_ref(), &images)
            .map(|image| (*image).clone())
            .ok_or(ProvisionError::NoDockerImage { egg_id: egg.id })?;

        let expires_at = activated_on + self.policy.expiry_window(plan);
        let mut plan_meta = BTreeMap::new();
        plan_meta.insert(
            plan.name.clone(),
            PlanActivation {
                activated_on,
                expires_at,
            },
        );

        Ok(ProvisionedSpec {
            name: name.to_string(),
            owner_id: owner,
            egg_id: egg.id,
            node_id: node.id,
            allocation_id: allocation.id,
            limits: ResourceLimits {
                cpu: plan.cpu,
                memory: plan.memory,
                disk: plan.disk,
                swap: 0,
                io: self.policy.io_weight,
                oom_disabled: true,
            },
            feature_limits: FeatureLimits {
                databases: plan.databases,
                allocations: plan.allocations,
                backups: plan.backups,
            },
            image,
            startup: egg.startup.clone(),
            environment: egg.default_environment(),
            skip_scripts: false,
            activated_on,
            expires_at,
            plan: plan_meta,
        })
    }
}
