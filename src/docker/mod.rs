/// Docker module implements the sandbox backend by driving the Docker CLI:
/// slots are long-lived containers and invocations are `docker exec` calls.
pub mod backend;
