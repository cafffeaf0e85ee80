//! A minimal walk through the registry: a window system, a renderer on
//! top of it, and an application shell resolving the whole stack.
use ember_core::{ModuleDecl, Registry, RegistryInner};

fn main() {
    let registry = Registry::new();

    let app = registry
        .register_module(ModuleDecl {
            comment: "Example application shell.".to_string(),
            def: "hello-app 0:1 | entry-point".to_string(),
            load: Some(Box::new(|_: &mut RegistryInner| {
                println!("app up");
                0
            })),
            unload: Some(Box::new(|_: &mut RegistryInner| {
                println!("app down");
                0
            })),
            ..Default::default()
        })
        .unwrap();

    registry
        .register_module(ModuleDecl {
            comment: "Software renderer on top of the window system.".to_string(),
            def: "painter 1.0 | render+soft".to_string(),
            uses: "window 0:2".to_string(),
            load: Some(Box::new(|_: &mut RegistryInner| {
                println!("painter ready");
                0
            })),
            unload: Some(Box::new(|_: &mut RegistryInner| {
                println!("painter gone");
                0
            })),
            ..Default::default()
        })
        .unwrap();

    registry
        .register_module(ModuleDecl {
            comment: "Pretend window system.".to_string(),
            def: "window-x 0:2.1 | window 0:2".to_string(),
            load: Some(Box::new(|_: &mut RegistryInner| {
                println!("window open");
                0
            })),
            unload: Some(Box::new(|_: &mut RegistryInner| {
                println!("window closed");
                0
            })),
            ..Default::default()
        })
        .unwrap();

    // The app becomes the root; the renderer pulls the window system in
    // before its own callback runs.
    registry.use_interfaces(app, "render+soft").unwrap();
    println!(
        "engine is running, registry holds {} bytes",
        registry.memory_usage()
    );

    registry.unuse_interfaces(app, "render+soft").unwrap();
    registry.cleanup();
}
