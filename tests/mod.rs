
// Integration suite:
// - smoke_tests: config, cache actor and the parse pipeline without a network
// - feed_mock: end-to-end queries against a mocked HTTP server
