// fed-test-utils: shared test doubles for the federation suite.
//
// Provides a scriptable mock data center and a canned routing resolver for
// integration testing of the federator without any real upstream.

pub mod mock_center;
pub mod mock_routing;

pub use mock_center::{MockCenter, ScriptedResponse};
pub use mock_routing::MockRouting;
