// Test modules for natmap
// Each module exercises the corresponding source file; shared mocks live in helpers

mod helpers;
mod natpmp_tests;
