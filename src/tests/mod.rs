/*
    Integration tests for the observed-remove containers

    Test suite covering:
    - Literal end-to-end scenarios (sizes, out-of-order merge, flush aging)
    - Convergence, idempotence and batch-order independence properties
    - Signed-variant authorization and batch atomicity
    - Persistent backend behavior across reopen and shared databases
*/

pub mod scenario_tests;
