mod common;

mod escalation_tests;
