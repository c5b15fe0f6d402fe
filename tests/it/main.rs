/*! End-to-end tests for the replicate-sync replication engine.
 *
 * This test suite is organized as a single integration test binary
 * following the pattern described by matklad in
 * https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html
 *
 * The module structure mirrors the testable properties and end-to-end
 * scenarios named in the component design:
 * - round_trip: single- and multi-client pull/push convergence, offline
 *   edits, and startup change-notification buffering
 * - divergence: snapshot recovery when local state has diverged
 * - reconciliation: removal of local phantom documents
 * - leader_election: cross-tab leader uniqueness and failover
 */

mod divergence;
mod helpers;
mod leader_election;
mod reconciliation;
mod round_trip;
