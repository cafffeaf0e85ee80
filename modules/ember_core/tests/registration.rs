//! Registration round-trips and the error surface of the registry.
use ember_core::{error_string, ModError, ModuleDecl, Registry};

fn decl(def: &str, uses: &str) -> ModuleDecl {
    ModuleDecl {
        def: def.to_string(),
        uses: uses.to_string(),
        ..Default::default()
    }
}

#[test]
fn registration_round_trip() {
    let registry = Registry::new();
    let main = registry.register_module(decl("main | entry", "")).unwrap();
    registry
        .register_module(decl("canvas-impl | canvas 1", ""))
        .unwrap();

    let painter = registry
        .register_module(decl("painter 1.0 | paint; brush 0:2", "canvas 1"))
        .unwrap();
    registry.unregister_module(painter).unwrap();

    // The unregistration took the provider with it.
    let err = registry.use_interfaces(main, "paint").unwrap_err();
    assert_eq!(err.code(), -62);

    // Registering the same declaration again restores everything.
    registry
        .register_module(decl("painter 1.0 | paint; brush 0:2", "canvas 1"))
        .unwrap();
    registry.use_interfaces(main, "paint").unwrap();
}

#[test]
fn syntax_errors_carry_their_codes() {
    let registry = Registry::new();

    assert_eq!(
        registry.register_module(decl("m 1.0 stray | a", "")),
        Err(ModError::DefDelimiter { offset: 6 })
    );
    assert_eq!(
        registry
            .register_module(decl("m | a", "b c d"))
            .unwrap_err()
            .code(),
        -41
    );
    assert_eq!(
        registry
            .register_module(decl("m | render[]x", ""))
            .unwrap_err()
            .code(),
        -18
    );

    assert_eq!(
        error_string(-4),
        "Invalid definition for module, expected '|' or end of string."
    );
    assert_eq!(error_string(-41), "Invalid character in use string.");
}

#[test]
fn stale_handles_are_errors_everywhere() {
    let registry = Registry::new();
    let m = registry.register_module(decl("m | x", "")).unwrap();
    registry.unregister_module(m).unwrap();

    assert_eq!(registry.use_interfaces(m, ""), Err(ModError::InvalidHandle));
    assert_eq!(
        registry.unuse_interfaces(m, ""),
        Err(ModError::InvalidHandle)
    );
    assert_eq!(registry.unregister_module(m), Err(ModError::InvalidHandle));
}

#[test]
fn memory_usage_grows_with_content() {
    let registry = Registry::new();
    let empty = registry.memory_usage();

    registry
        .register_module(decl("m 0:1.2 | paint; brush 1", "canvas; !legacy-paint"))
        .unwrap();
    assert!(registry.memory_usage() > empty);
}
