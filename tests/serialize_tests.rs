// Round-trip tests for the compiled-module format: serializing a compiled
// module and loading it back must not change observable behavior.

use std::io::Write;

use vesper::serialize::{read_module, write_module};
use vesper::{VesperError, Vm};

const PROGRAM: &str = r#"
    fun make_counter(start=0)
        var n = start
        fun step(by=1) n = n + by return n end
        return step
    end

    class Shape
        fun new(name) this.name = name end
        fun describe() return this.name + "/" + String(this.area()) end
    end
    class Square is Shape
        fun new(side)
            super.new("square")
            this.side = side
        end
        fun area() return this.side * this.side end
    end

    var c = make_counter(10)
    print(c(), c(5))
    print(Square(3).describe())
    var total = 0
    for var v in (1, 2, 3, 4) total = total + v end
    print(total)
    try raise TypeException("wired") except TypeException e print(e._err) end
"#;

fn run_directly(src: &str) -> String {
    let mut vm = Vm::new();
    vm.capture_output();
    vm.interpret("program.vsp", src).expect("direct run should succeed");
    vm.take_output()
}

fn run_through_serializer(src: &str) -> String {
    let image = {
        let mut vm = Vm::new();
        let function = vm
            .compile_source("program.vsp", src, "program")
            .expect("compilation should succeed");
        write_module(&vm, function).expect("serialization should succeed")
    };

    let mut vm = Vm::new();
    vm.capture_output();
    let module = vm.new_module("program", "program.vbc");
    let function = read_module(&mut vm, module, &image).expect("deserialization should succeed");
    vm.run_function(function).expect("loaded module should run");
    vm.take_output()
}

#[test]
fn serialized_module_behaves_identically() {
    assert_eq!(run_directly(PROGRAM), run_through_serializer(PROGRAM));
}

#[test]
fn super_constructor_chain_survives_serialization() {
    let out = run_through_serializer(PROGRAM);
    assert!(out.contains("square/9"));
}

#[test]
fn binary_modules_load_through_import() {
    let dir = tempfile::tempdir().unwrap();

    // Compile a library module to disk as .vbc only.
    let image = {
        let mut vm = Vm::new();
        let function = vm
            .compile_source(
                "lib.vsp",
                "fun triple(x) return x * 3 end\nvar magic = 7",
                "lib",
            )
            .unwrap();
        write_module(&vm, function).unwrap()
    };
    let mut f = std::fs::File::create(dir.path().join("lib.vbc")).unwrap();
    f.write_all(&image).unwrap();
    drop(f);

    let mut vm = Vm::new();
    vm.capture_output();
    vm.add_search_path(dir.path());
    vm.interpret("main.vsp", "import lib for triple, magic\nprint(triple(magic))").unwrap();
    assert_eq!(vm.take_output(), "21\n");
}

#[test]
fn corrupt_binary_module_raises_import_exception() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("junk.vbc"), b"garbage").unwrap();

    let mut vm = Vm::new();
    vm.add_search_path(dir.path());
    match vm.interpret("main.vsp", "import junk") {
        Err(VesperError::Runtime(r)) => assert_eq!(r.class, "ImportException"),
        other => panic!("expected ImportException, got {:?}", other),
    }
}
