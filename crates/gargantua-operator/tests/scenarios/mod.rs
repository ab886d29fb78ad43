//! End-to-end scenarios for the wired operator
//!
//! Each story starts the full operator (informers, dispatch loops, queues
//! and all five controllers) against an in-memory store, seeds resources the
//! way an administrator or the HobbyFarm API would, and polls the store until
//! the system converges. The test itself plays the Terraform controller by
//! publishing Executions for the States the provisioner creates.
//!
//! ```bash
//! cargo test -p gargantua-operator --test scenarios
//! ```

mod dynamic_bind;
mod harness;
mod pools;
