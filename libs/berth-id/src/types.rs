//! Typed ids for provisioning resources.

use crate::define_id;

// =============================================================================
// Accounts and catalog
// =============================================================================

define_id!(UserId, "usr");
define_id!(PlanId, "plan");
define_id!(EggId, "egg");

// =============================================================================
// Placement
// =============================================================================

define_id!(LocationId, "loc");
define_id!(NodeId, "node");
define_id!(AllocationId, "alloc");

// =============================================================================
// Provisioning
// =============================================================================

define_id!(InstanceId, "inst");
define_id!(ReservationId, "rsv");
define_id!(RequestId, "req");
